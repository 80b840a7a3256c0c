//! Scripted backend and memory probe shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use slmbench_core::{Category, PromptItem, Result, SlmBenchError};
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatRequest, ChunkStream, InferenceBackend};
use crate::memory::MemoryProbe;

pub(crate) enum Step {
    Chunk { after_ms: u64, text: String },
    Fail(SlmBenchError),
    /// Never yields again.
    Hang,
    /// Cancel the token, then hang: simulates Ctrl-C while awaiting a chunk.
    Cancel(CancellationToken),
}

impl Step {
    pub(crate) fn chunk(after_ms: u64, text: &str) -> Self {
        Step::Chunk {
            after_ms,
            text: text.to_string(),
        }
    }
}

pub(crate) fn script_stream(steps: Vec<Step>) -> ChunkStream {
    Box::pin(futures::stream::unfold(
        steps.into_iter(),
        |mut steps| async move {
            match steps.next()? {
                Step::Chunk { after_ms, text } => {
                    tokio::time::sleep(Duration::from_millis(after_ms)).await;
                    Some((Ok(text), steps))
                }
                Step::Fail(e) => Some((Err(e), steps)),
                Step::Hang => std::future::pending().await,
                Step::Cancel(token) => {
                    token.cancel();
                    std::future::pending().await
                }
            }
        },
    ))
}

pub(crate) enum Reply {
    Stream(Vec<Step>),
    Refuse(SlmBenchError),
}

/// Plays queued replies in order; once the queue is empty every call gets a
/// short successful stream.
pub(crate) struct ScriptedBackend {
    models: Vec<String>,
    hung_listing: bool,
    replies: Mutex<VecDeque<Reply>>,
    chat_replies: Mutex<VecDeque<Result<String>>>,
    pub(crate) stream_calls: AtomicUsize,
    pub(crate) chat_requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub(crate) fn new(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            hung_listing: false,
            replies: Mutex::new(VecDeque::new()),
            chat_replies: Mutex::new(VecDeque::new()),
            stream_calls: AtomicUsize::new(0),
            chat_requests: Mutex::new(Vec::new()),
        }
    }

    /// `list_models` never answers, like a runtime that accepted the
    /// connection and stalled.
    pub(crate) fn hung_listing(mut self) -> Self {
        self.hung_listing = true;
        self
    }

    pub(crate) fn reply(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn chat_reply(self, reply: Result<String>) -> Self {
        self.chat_replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn ok_stream() -> Vec<Step> {
    vec![
        Step::chunk(100, "one two "),
        Step::chunk(50, "three four "),
        Step::chunk(50, "five"),
    ]
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn list_models(&self) -> Result<Vec<String>> {
        if self.hung_listing {
            std::future::pending::<()>().await;
        }
        Ok(self.models.clone())
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Stream(steps)) => Ok(script_stream(steps)),
            Some(Reply::Refuse(e)) => Err(e),
            None => Ok(script_stream(ok_stream())),
        }
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        self.chat_requests.lock().unwrap().push(request.clone());
        let next = self.chat_replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok("ok".to_string()))
    }
}

/// Reports `base + step * n` on the n-th read.
pub(crate) struct CountingProbe {
    base: u64,
    step: u64,
    pub(crate) reads: AtomicU64,
}

impl CountingProbe {
    pub(crate) fn new(base: u64, step: u64) -> Self {
        Self {
            base,
            step,
            reads: AtomicU64::new(0),
        }
    }

    pub(crate) fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl MemoryProbe for CountingProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        Some(self.base + self.step * n)
    }
}

pub(crate) fn prompt_item(id: &str, category: Category) -> PromptItem {
    PromptItem {
        id: id.to_string(),
        category,
        prompt: format!("Prompt for {}", id),
        reference: None,
        max_tokens: 100,
    }
}
