use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use slmbench_core::{GenerationOptions, Result};

/// Incremental text fragments in arrival order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub options: GenerationOptions,
}

impl ChatRequest {
    pub fn new(model: &str, prompt: &str, options: GenerationOptions) -> Self {
        Self {
            model: model.to_string(),
            prompt: prompt.to_string(),
            options,
        }
    }
}

/// The model-serving runtime as seen by the measurement core.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Names of the models the runtime can serve.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Start a streaming generation. Errors here happen before any chunk.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Single non-streaming generation returning the whole reply.
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}
