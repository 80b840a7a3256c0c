use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slmbench_core::{
    round_to, GenerationOptions, ItemMetrics, ItemStatus, PromptItem, Result, SlmBenchError,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::{ChatRequest, InferenceBackend};
use crate::memory::{MemoryProbe, MemoryReading, MemoryScope, DEFAULT_SAMPLE_INTERVAL};
use crate::stream_timer::{StreamFailure, StreamTimer, StreamTiming};

/// Streaming responses carry no exact token count, so output tokens are
/// estimated from whitespace-separated words. Expect a 10-20% error band
/// against a real tokenizer, wider for code and non-English text.
pub const TOKENS_PER_WORD: f64 = 1.3;

pub fn estimate_tokens(word_count: u64) -> u64 {
    (word_count as f64 * TOKENS_PER_WORD) as u64
}

/// Output tokens over wall-clock seconds; 0.0 for a zero duration.
pub fn tokens_per_second(tokens: u64, duration_secs: f64) -> f64 {
    match duration_secs > 0.0 {
        true => tokens as f64 / duration_secs,
        false => 0.0,
    }
}

/// Throughput after the first chunk. When no time elapsed after the first
/// chunk there is no separate decode phase and overall throughput is used.
pub fn decode_tokens_per_second(tokens: u64, duration_secs: f64, ttft_secs: Option<f64>) -> f64 {
    let overall = tokens_per_second(tokens, duration_secs);
    match ttft_secs.map(|ttft| duration_secs - ttft) {
        Some(window) if window > 0.0 => tokens.saturating_sub(1) as f64 / window,
        _ => overall,
    }
}

/// One attempt's measurements plus the raw output on success.
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub metrics: ItemMetrics,
    pub output: Option<String>,
}

/// Runs one prompt once. Implementations return `Err` only for cancellation.
#[async_trait]
pub trait ItemRecorder: Send + Sync {
    async fn record(
        &self,
        item: &PromptItem,
        model: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Recorded>;
}

pub struct MetricsRecorder {
    backend: Arc<dyn InferenceBackend>,
    probe: Arc<dyn MemoryProbe>,
    request_timeout: Option<Duration>,
}

impl MetricsRecorder {
    pub fn new(backend: Arc<dyn InferenceBackend>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            backend,
            probe,
            request_timeout: None,
        }
    }

    /// Without a timeout an inference call may block indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn stream_once(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<StreamTiming, StreamFailure> {
        let timer = StreamTimer::new(cancel.clone()).with_budget(self.request_timeout);
        let start = Instant::now();

        match timer.guard(start, self.backend.chat_stream(request)).await {
            Ok(stream) => timer.consume(start, stream).await,
            Err(error) => Err(StreamFailure {
                error,
                partial: StreamTiming {
                    duration: start.elapsed(),
                    ..Default::default()
                },
            }),
        }
    }
}

#[async_trait]
impl ItemRecorder for MetricsRecorder {
    async fn record(
        &self,
        item: &PromptItem,
        model: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
    ) -> Result<Recorded> {
        let request = ChatRequest::new(model, &item.prompt, options);

        let scope = MemoryScope::start(self.probe.clone(), DEFAULT_SAMPLE_INTERVAL);
        let outcome = self.stream_once(&request, cancel).await;
        let memory = scope.finish();

        let recorded = match outcome {
            Ok(timing) if timing.chunk_count == 0 => {
                failed_record(&timing, &memory, ItemStatus::Failure, &SlmBenchError::EmptyResponse)
            }
            Ok(timing) => success_record(timing, &memory),
            Err(failure) if failure.error.is_cancellation() => return Err(SlmBenchError::Cancelled),
            Err(failure) => {
                let status = match failure.error.is_timeout() {
                    true => ItemStatus::Timeout,
                    false => ItemStatus::Failure,
                };
                failed_record(&failure.partial, &memory, status, &failure.error)
            }
        };

        match recorded.metrics.status {
            ItemStatus::Success => debug!(
                item = %item.id,
                tokens = recorded.metrics.output_tokens,
                tps = recorded.metrics.tokens_per_second,
                "Item recorded"
            ),
            _ => warn!(
                item = %item.id,
                status = recorded.metrics.status.as_str(),
                error = recorded.metrics.error.as_deref().unwrap_or(""),
                "Item attempt failed"
            ),
        }

        Ok(recorded)
    }
}

fn success_record(timing: StreamTiming, memory: &MemoryReading) -> Recorded {
    let duration = timing.duration.as_secs_f64();
    let ttft = timing.ttft.map(|t| t.as_secs_f64());
    let words = timing.output_text.split_whitespace().count() as u64;
    let tokens = estimate_tokens(words);

    let metrics = ItemMetrics {
        duration: round_to(duration, 3),
        ttft: ttft.map(|t| round_to(t, 3)),
        output_tokens: tokens,
        output_words: words,
        chunk_count: timing.chunk_count,
        tokens_per_second: round_to(tokens_per_second(tokens, duration), 2),
        decode_tps: round_to(decode_tokens_per_second(tokens, duration, ttft), 2),
        peak_memory_mb: round_to(memory.peak_mb(), 2),
        memory_delta_gb: round_to(memory.delta_gb(), 3),
        status: ItemStatus::Success,
        error: None,
    };

    Recorded {
        metrics,
        output: Some(timing.output_text),
    }
}

/// Partial timing is kept for diagnosis; throughput stays at zero and the
/// partial text is discarded.
fn failed_record(
    partial: &StreamTiming,
    memory: &MemoryReading,
    status: ItemStatus,
    error: &SlmBenchError,
) -> Recorded {
    let metrics = ItemMetrics {
        duration: round_to(partial.duration.as_secs_f64(), 3),
        ttft: partial.ttft.map(|t| round_to(t.as_secs_f64(), 3)),
        chunk_count: partial.chunk_count,
        peak_memory_mb: round_to(memory.peak_mb(), 2),
        memory_delta_gb: round_to(memory.delta_gb(), 3),
        ..ItemMetrics::failed(status, error.to_string())
    };

    Recorded {
        metrics,
        output: None,
    }
}
