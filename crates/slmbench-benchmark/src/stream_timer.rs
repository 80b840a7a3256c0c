use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use slmbench_core::{Result, SlmBenchError};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::ChunkStream;

/// Timing facts derived from one consumed stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamTiming {
    pub ttft: Option<Duration>,
    pub output_text: String,
    pub chunk_count: u64,
    pub duration: Duration,
}

/// A stream that stopped early, with whatever had accumulated.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct StreamFailure {
    pub error: SlmBenchError,
    pub partial: StreamTiming,
}

/// Consumes a chunk stream while watching the clock, a cancellation token,
/// and an optional deadline. Never retries and never looks at content.
#[derive(Debug, Clone)]
pub struct StreamTimer {
    cancel: CancellationToken,
    budget: Option<Duration>,
}

impl StreamTimer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            budget: None,
        }
    }

    /// Wall-clock budget measured from the `start` passed to each call.
    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    /// Await `fut` unless cancellation or the deadline comes first.
    pub async fn guard<T, F>(&self, start: Instant, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SlmBenchError::Cancelled),
            _ = wait_for_deadline(start, self.budget) => {
                Err(SlmBenchError::Timeout(self.budget.unwrap_or_default().as_secs_f64()))
            }
            result = fut => result,
        }
    }

    pub async fn consume(
        &self,
        start: Instant,
        mut stream: ChunkStream,
    ) -> std::result::Result<StreamTiming, StreamFailure> {
        let mut timing = StreamTiming::default();

        loop {
            let next = self.guard(start, async { Ok::<_, SlmBenchError>(stream.next().await) }).await;

            match next {
                Ok(Some(Ok(text))) => {
                    if timing.ttft.is_none() {
                        timing.ttft = Some(start.elapsed());
                    }
                    timing.output_text.push_str(&text);
                    timing.chunk_count += 1;
                }
                Ok(Some(Err(error))) | Err(error) => {
                    timing.duration = start.elapsed();
                    return Err(StreamFailure {
                        error,
                        partial: timing,
                    });
                }
                Ok(None) => break,
            }
        }

        timing.duration = start.elapsed();
        Ok(timing)
    }
}

async fn wait_for_deadline(start: Instant, budget: Option<Duration>) {
    match budget {
        Some(budget) => tokio::time::sleep_until(start + budget).await,
        None => std::future::pending().await,
    }
}
