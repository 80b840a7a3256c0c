pub mod advisor;
pub mod aggregator;
pub mod backend;
pub mod memory;
pub mod ollama;
pub mod recorder;
pub mod retry;
pub mod runner;
pub mod store;
pub mod stream_timer;

#[cfg(test)]
mod test_support;

pub use advisor::{build_prompt, parse_verdict, ComparisonAdviser};
pub use aggregator::RunAggregator;
pub use backend::{ChatRequest, ChunkStream, InferenceBackend};
pub use memory::{MemoryProbe, MemoryReading, MemoryScope, SysinfoProbe};
pub use ollama::OllamaClient;
pub use recorder::{estimate_tokens, ItemRecorder, MetricsRecorder, Recorded, TOKENS_PER_WORD};
pub use retry::{AttemptState, RetryExecutor, RetryNotice, RetryOutcome};
pub use runner::{BenchmarkEvent, BenchmarkRunner, ModelReadiness, RunSettings};
pub use store::{load_dataset, unix_timestamp, ResultStore};
pub use stream_timer::{StreamFailure, StreamTimer, StreamTiming};
