use serde::{Deserialize, Serialize};

use crate::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Success,
    Failure,
    Timeout,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "success",
            ItemStatus::Failure => "failure",
            ItemStatus::Timeout => "timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemStatus::Success)
    }
}

/// Measurements for one inference call. Durations are seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetrics {
    pub duration: f64,
    /// `None` when the stream never produced a chunk.
    pub ttft: Option<f64>,
    pub output_tokens: u64,
    pub output_words: u64,
    pub chunk_count: u64,
    /// 0.0 when the duration is zero.
    pub tokens_per_second: f64,
    pub decode_tps: f64,
    pub peak_memory_mb: f64,
    pub memory_delta_gb: f64,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemMetrics {
    pub fn failed(status: ItemStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// One prompt's outcome for one model, whatever number of attempts it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub model: String,
    pub prompt: String,
    pub output: Option<String>,
    pub category: Option<Category>,
    pub metrics: ItemMetrics,
}

/// Round half away from zero to `places` decimals; non-finite input becomes 0.
pub fn round_to(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
