use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Generation settings a run was executed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// `None` when each item's own budget applied.
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub avg_tokens_per_second: f64,
    pub min_tokens_per_second: f64,
    pub max_tokens_per_second: f64,
    pub avg_ttft: f64,
    pub min_ttft: f64,
    pub max_ttft: f64,
    pub avg_decode_tps: f64,
    pub avg_duration: f64,
    pub avg_output_tokens: f64,
    pub total_tokens_generated: u64,
    pub total_time_spent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub count: u32,
    pub avg_tps: f64,
}

/// Aggregate over every item of one model run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub timestamp: u64,
    pub config: RunConfig,
    pub total_items: u32,
    pub successful: u32,
    pub failed: u32,
    pub success_rate: f64,
    /// `None` when no item succeeded.
    pub performance: Option<PerformanceSummary>,
    pub category_breakdown: BTreeMap<String, CategoryStats>,
    pub failed_items: Vec<String>,
}

impl RunSummary {
    pub fn avg_tps(&self) -> f64 {
        self.performance
            .as_ref()
            .map(|p| p.avg_tokens_per_second)
            .unwrap_or(0.0)
    }

    pub fn avg_ttft(&self) -> f64 {
        self.performance.as_ref().map(|p| p.avg_ttft).unwrap_or(0.0)
    }

    pub fn avg_decode_tps(&self) -> f64 {
        self.performance
            .as_ref()
            .map(|p| p.avg_decode_tps)
            .unwrap_or(0.0)
    }
}
