pub mod comparison;
pub mod config;
pub mod error;
pub mod metrics;
pub mod prompt;
pub mod summary;

pub use comparison::{Analysis, ComparisonMeta, ComparisonReport, StructuredVerdict};
pub use config::{normalize_host, DefaultsConfig, OllamaConfig, SlmBenchConfig, DEFAULT_OLLAMA_HOST};
pub use error::{Result, SlmBenchError};
pub use metrics::{round_to, ItemMetrics, ItemResult, ItemStatus};
pub use prompt::{Category, GenerationOptions, PromptItem};
pub use summary::{CategoryStats, PerformanceSummary, RunConfig, RunSummary};
