use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RunSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonMeta {
    pub timestamp: u64,
    pub models_compared: Vec<String>,
    pub analysis_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Verdict sections requested from the analysis model. Shapes vary between
/// models, so each section is kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredVerdict {
    #[serde(default)]
    pub ranking: Value,
    #[serde(default)]
    pub strengths_weaknesses: Value,
    #[serde(default)]
    pub recommendations: Value,
    #[serde(default)]
    pub insights: Value,
    #[serde(default)]
    pub winner: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Full narrative as returned; empty when the analysis call failed.
    pub readable: String,
    pub structured: Option<StructuredVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub meta: ComparisonMeta,
    pub summaries: Vec<RunSummary>,
    pub analysis: Analysis,
}

impl ComparisonReport {
    pub fn is_degraded(&self) -> bool {
        self.meta.error.is_some()
    }
}
