use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use slmbench_core::{
    round_to, Category, GenerationOptions, ItemResult, ItemStatus, PromptItem, Result, RunConfig,
    SlmBenchConfig, SlmBenchError,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{ChatRequest, InferenceBackend};
use crate::memory::{MemoryProbe, MemoryScope, DEFAULT_SAMPLE_INTERVAL};
use crate::recorder::MetricsRecorder;
use crate::retry::{RetryExecutor, DEFAULT_RETRY_DELAY};

const PREVIEW_CHARS: usize = 50;
const WARMUP_PROMPT: &str = "test";

/// Progress of one model's pass, in the order things happen.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BenchmarkEvent {
    ItemStarted { current: u32, total: u32, id: String, category: Category, preview: String },
    Retrying { id: String, attempt: u32, max_retries: u32, error: String },
    ItemCompleted { current: u32, total: u32, attempts: u32, result: ItemResult },
    ItemFailed { current: u32, total: u32, attempts: u32, result: ItemResult },
    Cancelled { model: String, completed: u32 },
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Overrides every item's own budget when set.
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
            max_retries: 2,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: None,
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &SlmBenchConfig) -> Self {
        Self {
            max_tokens: config.defaults.max_tokens,
            temperature: config.defaults.temperature,
            max_retries: config.defaults.max_retries,
            retry_delay: config.defaults.retry_delay(),
            request_timeout: config.ollama.request_timeout(),
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            max_retries: self.max_retries,
        }
    }
}

/// Cost of loading a model, measured around the warmup call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelReadiness {
    pub load_time: f64,
    pub memory_delta_gb: f64,
    pub peak_memory_gb: f64,
}

pub struct BenchmarkRunner {
    backend: Arc<dyn InferenceBackend>,
    probe: Arc<dyn MemoryProbe>,
    settings: RunSettings,
}

impl BenchmarkRunner {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        probe: Arc<dyn MemoryProbe>,
        settings: RunSettings,
    ) -> Self {
        Self {
            backend,
            probe,
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Installed models; an error here means the runtime is unreachable.
    pub async fn check_connection(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let models = self.installed_models(cancel).await?;
        info!(count = models.len(), "Connected to inference runtime");
        Ok(models)
    }

    async fn installed_models(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SlmBenchError::Cancelled),
            models = self.backend.list_models() => models,
        }
    }

    /// Confirms the model is installed and loads it with a one-token
    /// generation. `ModelNotFound` means the model should be skipped.
    #[instrument(skip(self, cancel))]
    pub async fn verify_model(&self, model: &str, cancel: &CancellationToken) -> Result<ModelReadiness> {
        info!("Verifying model: {}", model);
        let installed = self.installed_models(cancel).await?;
        if !installed.iter().any(|name| name.contains(model)) {
            return Err(SlmBenchError::ModelNotFound(format!(
                "{} (available: {}; pull it with `ollama pull {}`)",
                model,
                installed.join(", "),
                model
            )));
        }

        let request = ChatRequest::new(
            model,
            WARMUP_PROMPT,
            GenerationOptions {
                max_tokens: Some(1),
                temperature: self.settings.temperature,
            },
        );

        let scope = MemoryScope::start(self.probe.clone(), DEFAULT_SAMPLE_INTERVAL);
        let start = Instant::now();
        let warmup = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SlmBenchError::Cancelled),
            reply = self.backend.chat(&request) => reply,
        };
        let load_time = start.elapsed().as_secs_f64();
        let memory = scope.finish();
        warmup?;

        let readiness = ModelReadiness {
            load_time: round_to(load_time, 2),
            memory_delta_gb: round_to(memory.delta_gb(), 3),
            peak_memory_gb: round_to(memory.peak_mb() / 1024.0, 3),
        };
        info!(model, load_time = readiness.load_time, "Model ready");
        Ok(readiness)
    }

    /// One strictly sequential pass over the dataset. Cancellation aborts the
    /// pass with no record for the item in flight.
    #[instrument(skip(self, items, cancel, events))]
    pub async fn run_model(
        &self,
        model: &str,
        items: &[PromptItem],
        cancel: &CancellationToken,
        events: &UnboundedSender<BenchmarkEvent>,
    ) -> Result<Vec<ItemResult>> {
        let recorder = MetricsRecorder::new(self.backend.clone(), self.probe.clone())
            .with_request_timeout(self.settings.request_timeout);
        let executor = RetryExecutor::new(recorder, self.settings.max_retries)
            .with_delay(self.settings.retry_delay);

        let total = items.len() as u32;
        let mut results = Vec::with_capacity(items.len());
        info!(model, items = total, "Starting benchmark pass");

        for (idx, item) in items.iter().enumerate() {
            let current = idx as u32 + 1;
            if cancel.is_cancelled() {
                return Err(self.abort(model, results.len(), events));
            }

            let _ = events.send(BenchmarkEvent::ItemStarted {
                current,
                total,
                id: item.id.clone(),
                category: item.category,
                preview: item.preview(PREVIEW_CHARS),
            });

            let options =
                GenerationOptions::for_item(item, self.settings.max_tokens, self.settings.temperature);
            let outcome = executor
                .execute(item, model, options, cancel, |notice| {
                    let _ = events.send(BenchmarkEvent::Retrying {
                        id: item.id.clone(),
                        attempt: notice.attempt,
                        max_retries: notice.max_retries,
                        error: notice.metrics.error.clone().unwrap_or_default(),
                    });
                })
                .await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancellation() => {
                    return Err(self.abort(model, results.len(), events));
                }
                Err(e) => return Err(e),
            };

            let result = ItemResult {
                id: item.id.clone(),
                model: model.to_string(),
                prompt: item.prompt.clone(),
                output: outcome.recorded.output,
                category: Some(item.category),
                metrics: outcome.recorded.metrics,
            };

            let event = match result.metrics.status {
                ItemStatus::Success => BenchmarkEvent::ItemCompleted {
                    current,
                    total,
                    attempts: outcome.attempts,
                    result: result.clone(),
                },
                _ => BenchmarkEvent::ItemFailed {
                    current,
                    total,
                    attempts: outcome.attempts,
                    result: result.clone(),
                },
            };
            let _ = events.send(event);
            results.push(result);
        }

        debug!(model, completed = results.len(), "Benchmark pass finished");
        Ok(results)
    }

    fn abort(&self, model: &str, completed: usize, events: &UnboundedSender<BenchmarkEvent>) -> SlmBenchError {
        warn!(model, completed, "Benchmark pass aborted");
        let _ = events.send(BenchmarkEvent::Cancelled {
            model: model.to_string(),
            completed: completed as u32,
        });
        SlmBenchError::Cancelled
    }
}
