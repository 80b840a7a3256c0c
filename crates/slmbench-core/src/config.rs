use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, SlmBenchError};

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlmBenchConfig {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default = "default_supported_models")]
    pub supported_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub host: String,
    /// No timeout is applied to inference calls unless this is set.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_OLLAMA_HOST.to_string(),
            request_timeout_secs: None,
        }
    }
}

impl OllamaConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub model: String,
    pub temperature: f32,
    /// Overrides every item's own budget when set.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub analysis_model: String,
    pub analysis_temperature: f32,
    pub data_path: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: "phi3".to_string(),
            temperature: 0.7,
            max_tokens: None,
            max_retries: 2,
            retry_delay_ms: 1000,
            analysis_model: "deepseek-v3.1:671b-cloud".to_string(),
            analysis_temperature: 0.3,
            data_path: PathBuf::from("data/sample_subset.json"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl DefaultsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_supported_models() -> Vec<String> {
    ["phi3", "llama3", "gemma:2b"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SlmBenchConfig {
    fn default() -> Self {
        Self {
            ollama: OllamaConfig::default(),
            defaults: DefaultsConfig::default(),
            supported_models: default_supported_models(),
        }
    }
}

impl SlmBenchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, then `.env`, then process environment.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded environment from {:?}", path),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(SlmBenchError::Config(format!(".env: {}", e))),
        }

        let mut config = Self::new();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("OLLAMA_HOST") {
            self.ollama.host = normalize_host(&host);
        }
        if let Some(dir) = var("SLMBENCH_RESULTS_DIR") {
            self.defaults.results_dir = PathBuf::from(dir);
        }
        if let Some(model) = var("SLMBENCH_ANALYSIS_MODEL") {
            self.defaults.analysis_model = model;
        }
        if let Some(secs) = var("SLMBENCH_REQUEST_TIMEOUT_SECS") {
            let parsed = secs.trim().parse::<u64>().map_err(|_| {
                SlmBenchError::Config(format!(
                    "SLMBENCH_REQUEST_TIMEOUT_SECS must be a whole number of seconds, got {:?}",
                    secs
                ))
            })?;
            self.ollama.request_timeout_secs = Some(parsed);
        }
        Ok(())
    }
}

/// Accepts `host:port` as exported by `ollama serve` and trims trailing slashes.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    match host.starts_with("http://") || host.starts_with("https://") {
        true => host.to_string(),
        false => format!("http://{}", host),
    }
}
