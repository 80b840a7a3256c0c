use std::time::Duration;

use slmbench_core::{GenerationOptions, ItemMetrics, ItemStatus, PromptItem, Result, SlmBenchError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::recorder::{ItemRecorder, Recorded};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of one item under retry. `Aborted` ends the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
    Aborted,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::Pending | AttemptState::Attempting { .. })
    }
}

/// A failed attempt that will be retried.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    pub attempt: u32,
    pub max_retries: u32,
    pub metrics: ItemMetrics,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// The last attempt's record, successful or not.
    pub recorded: Recorded,
    pub attempts: u32,
    pub state: AttemptState,
}

pub struct RetryExecutor<R> {
    recorder: R,
    max_retries: u32,
    delay: Duration,
}

impl<R: ItemRecorder> RetryExecutor<R> {
    pub fn new(recorder: R, max_retries: u32) -> Self {
        Self {
            recorder,
            max_retries,
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Up to `max_retries + 1` attempts, stopping at the first success.
    /// Only cancellation is returned as `Err`.
    pub async fn execute<F>(
        &self,
        item: &PromptItem,
        model: &str,
        options: GenerationOptions,
        cancel: &CancellationToken,
        mut on_retry: F,
    ) -> Result<RetryOutcome>
    where
        F: FnMut(&RetryNotice),
    {
        let max_attempts = self.max_retries + 1;
        let mut state = AttemptState::Pending;
        debug!(item = %item.id, ?state, "Dispatching item");

        let mut attempt = 0;
        loop {
            attempt += 1;
            state = AttemptState::Attempting { attempt };
            debug!(item = %item.id, ?state);

            let recorded = match self.recorder.record(item, model, options, cancel).await {
                Ok(recorded) => recorded,
                Err(e) if e.is_cancellation() => {
                    info!(item = %item.id, state = ?AttemptState::Aborted, "Run aborted");
                    return Err(SlmBenchError::Cancelled);
                }
                Err(e) => Recorded {
                    metrics: ItemMetrics::failed(ItemStatus::Failure, e.to_string()),
                    output: None,
                },
            };

            if recorded.metrics.is_success() {
                state = AttemptState::Succeeded { attempts: attempt };
                debug!(item = %item.id, ?state);
                return Ok(RetryOutcome {
                    recorded,
                    attempts: attempt,
                    state,
                });
            }

            if attempt >= max_attempts {
                state = AttemptState::Failed { attempts: attempt };
                debug!(item = %item.id, ?state);
                return Ok(RetryOutcome {
                    recorded,
                    attempts: attempt,
                    state,
                });
            }

            on_retry(&RetryNotice {
                attempt,
                max_retries: self.max_retries,
                metrics: recorded.metrics,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(item = %item.id, state = ?AttemptState::Aborted, "Run aborted during retry pause");
                    return Err(SlmBenchError::Cancelled);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prompt_item;
    use async_trait::async_trait;
    use slmbench_core::Category;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyRecorder {
        failures: u32,
        calls: AtomicU32,
        cancel_on_call: Option<u32>,
    }

    impl FlakyRecorder {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                cancel_on_call: None,
            }
        }
    }

    #[async_trait]
    impl ItemRecorder for FlakyRecorder {
        async fn record(
            &self,
            _item: &PromptItem,
            _model: &str,
            _options: GenerationOptions,
            _cancel: &CancellationToken,
        ) -> Result<Recorded> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.cancel_on_call == Some(call) {
                return Err(SlmBenchError::Cancelled);
            }
            let metrics = match call <= self.failures {
                true => ItemMetrics::failed(ItemStatus::Failure, format!("attempt {} failed", call)),
                false => ItemMetrics {
                    duration: 1.0,
                    ttft: Some(0.1),
                    ..Default::default()
                },
            };
            Ok(Recorded {
                metrics,
                output: None,
            })
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            max_tokens: Some(50),
            temperature: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        let item = prompt_item("a", Category::Reasoning);
        let executor = RetryExecutor::new(FlakyRecorder::new(2), 3);
        let mut notices = Vec::new();

        let outcome = executor
            .execute(&item, "phi3", options(), &CancellationToken::new(), |n| {
                notices.push(n.attempt)
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.state, AttemptState::Succeeded { attempts: 3 });
        assert!(outcome.recorded.metrics.is_success());
        assert_eq!(notices, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_failure() {
        let item = prompt_item("a", Category::Reasoning);
        let executor = RetryExecutor::new(FlakyRecorder::new(5), 1);

        let outcome = executor
            .execute(&item, "phi3", options(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.state, AttemptState::Failed { attempts: 2 });
        assert_eq!(
            outcome.recorded.metrics.error.as_deref(),
            Some("attempt 2 failed")
        );
        assert_eq!(executor.recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_is_single_attempt() {
        let item = prompt_item("a", Category::Reasoning);
        let executor = RetryExecutor::new(FlakyRecorder::new(1), 0);

        let outcome = executor
            .execute(&item, "phi3", options(), &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.recorded.metrics.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_retried() {
        let item = prompt_item("a", Category::Reasoning);
        let mut recorder = FlakyRecorder::new(1);
        recorder.cancel_on_call = Some(2);
        let executor = RetryExecutor::new(recorder, 5);

        let err = executor
            .execute(&item, "phi3", options(), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(executor.recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_pause() {
        let item = prompt_item("a", Category::Reasoning);
        let executor =
            RetryExecutor::new(FlakyRecorder::new(10), 5).with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            canceller.cancel();
        });

        let err = executor
            .execute(&item, "phi3", options(), &cancel, |_| {})
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(executor.recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AttemptState::Pending.is_terminal());
        assert!(!AttemptState::Attempting { attempt: 1 }.is_terminal());
        assert!(AttemptState::Failed { attempts: 3 }.is_terminal());
        assert!(AttemptState::Aborted.is_terminal());
    }
}
