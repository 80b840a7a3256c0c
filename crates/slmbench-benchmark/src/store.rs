use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use slmbench_core::{ComparisonReport, ItemResult, PromptItem, Result, RunSummary, SlmBenchError};
use tracing::{debug, info};

pub const CSV_LOG_FILE: &str = "benchmark_log.csv";

const CSV_HEADER: &str = "timestamp,model,avg_tps,avg_ttft,avg_decode_tps,success_rate,total_items";

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Reads the prompt dataset: a JSON array of items with unique, non-empty
/// ids and positive token budgets.
pub fn load_dataset(path: &Path) -> Result<Vec<PromptItem>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SlmBenchError::Dataset(format!("{}: {}", path.display(), e)))?;
    let items: Vec<PromptItem> = serde_json::from_str(&content)
        .map_err(|e| SlmBenchError::Dataset(format!("{}: {}", path.display(), e)))?;

    let mut seen = HashSet::new();
    for item in &items {
        if item.id.trim().is_empty() {
            return Err(SlmBenchError::Dataset("item with empty id".to_string()));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(SlmBenchError::Dataset(format!("duplicate id '{}'", item.id)));
        }
        if item.max_tokens == 0 {
            return Err(SlmBenchError::Dataset(format!("item '{}' has max_tokens = 0", item.id)));
        }
    }

    info!(path = %path.display(), items = items.len(), "Loaded dataset");
    Ok(items)
}

#[derive(Serialize)]
struct RunFile<'a> {
    summary: &'a RunSummary,
    results: &'a [ItemResult],
}

/// Writes run artifacts under one results directory.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(CSV_LOG_FILE)
    }

    /// `run_{timestamp}_{model}.json` with `:` in the model name replaced.
    pub fn save_run(&self, summary: &RunSummary, results: &[ItemResult]) -> Result<PathBuf> {
        let name = format!("run_{}_{}.json", summary.timestamp, summary.model.replace(':', "_"));
        self.write_json(&name, &RunFile { summary, results })
    }

    /// Appends one row per completed run, writing the header first when the
    /// log is new. Runs with no successes log zero rates.
    pub fn append_csv(&self, summary: &RunSummary) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.csv_path();
        let is_new = !path.exists();

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if is_new {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(file, "{}", csv_row(summary))?;

        debug!(path = %path.display(), model = %summary.model, "Appended CSV row");
        Ok(path)
    }

    pub fn save_comparison(&self, report: &ComparisonReport) -> Result<PathBuf> {
        let name = format!("comparison_{}.json", report.meta.timestamp);
        self.write_json(&name, report)
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)?;
        debug!(path = %path.display(), "Wrote result file");
        Ok(path)
    }
}

fn csv_row(summary: &RunSummary) -> String {
    format!(
        "{},{},{:.2},{:.3},{:.2},{:.2}%,{}",
        summary.timestamp,
        summary.model,
        summary.avg_tps(),
        summary.avg_ttft(),
        summary.avg_decode_tps(),
        summary.success_rate * 100.0,
        summary.total_items
    )
}
