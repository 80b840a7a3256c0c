use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use slmbench_core::{Result, SlmBenchError};
use tracing::{debug, instrument};

use crate::backend::{ChatRequest, ChunkStream, InferenceBackend};

/// Applies to control calls only; generation calls are not time-limited here.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    temperature: f32,
}

/// One NDJSON line of a chat response (streaming or not).
#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn chat_body<'a>(request: &'a ChatRequest, stream: bool) -> OllamaChatRequest<'a> {
        OllamaChatRequest {
            model: &request.model,
            messages: vec![OllamaMessage {
                role: "user",
                content: &request.prompt,
            }],
            stream,
            options: OllamaOptions {
                num_predict: request.options.max_tokens,
                temperature: request.options.temperature,
            },
        }
    }

    async fn post_chat(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.host);
        let resp = self
            .client
            .post(&url)
            .json(&Self::chat_body(request, stream))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SlmBenchError::ModelNotFound(request.model.clone()));
        }
        Err(SlmBenchError::OllamaError(format!(
            "Chat failed: {} - {}",
            status,
            snippet(&body, 500)
        )))
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.host);
        let resp = self
            .client
            .get(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !resp.status().is_success() {
            return Err(SlmBenchError::OllamaError(format!(
                "Failed to list models: {}",
                resp.status()
            )));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| SlmBenchError::MalformedResponse(e.to_string()))?;

        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        debug!(count = names.len(), "Fetched models from Ollama");
        Ok(names)
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let resp = self.post_chat(request, true).await?;
        Ok(decode_chat_stream(resp.bytes_stream()))
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let resp = self.post_chat(request, false).await?;
        let body = resp.text().await.map_err(map_reqwest_error)?;

        match parse_line(body.trim()) {
            Some(result) => result,
            None => Err(SlmBenchError::MalformedResponse(format!(
                "no message in response: {}",
                snippet(&body, 500)
            ))),
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SlmBenchError {
    if e.is_connect() {
        return SlmBenchError::Connection(e.to_string());
    }
    if e.is_decode() || e.is_body() {
        return SlmBenchError::MalformedResponse(e.to_string());
    }
    SlmBenchError::Http(e.to_string())
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// `None` for lines that carry neither a message nor an error.
fn parse_line(line: &str) -> Option<Result<String>> {
    let parsed: ChatLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Some(Err(SlmBenchError::MalformedResponse(format!(
                "{} in line: {}",
                e,
                snippet(line, 200)
            ))))
        }
    };

    if let Some(error) = parsed.error {
        if error.contains("not found") {
            return Some(Err(SlmBenchError::ModelNotFound(error)));
        }
        return Some(Err(SlmBenchError::OllamaError(error)));
    }

    parsed.message.map(|m| Ok(m.content))
}

struct LineDecoder<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    queued: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> LineDecoder<S> {
    fn push_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(item) = parse_line(line) {
            if item.is_err() {
                self.finished = true;
            }
            self.queued.push_back(item);
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
            if self.finished {
                self.buffer.clear();
                return;
            }
        }
    }
}

/// Turn an NDJSON byte body into one chunk per message line. Lines may span
/// network frames. The stream ends after the first error.
pub(crate) fn decode_chat_stream<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let decoder = LineDecoder {
        body: Box::pin(body),
        buffer: Vec::new(),
        queued: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(decoder, |mut dec| async move {
        loop {
            if let Some(item) = dec.queued.pop_front() {
                return Some((item, dec));
            }
            if dec.finished {
                return None;
            }

            match dec.body.next().await {
                Some(Ok(bytes)) => {
                    dec.buffer.extend_from_slice(bytes.as_ref());
                    dec.drain_complete_lines();
                }
                Some(Err(e)) => {
                    dec.finished = true;
                    dec.queued
                        .push_back(Err(SlmBenchError::Connection(format!("stream dropped: {}", e))));
                }
                None => {
                    dec.finished = true;
                    let rest = std::mem::take(&mut dec.buffer);
                    dec.push_line(&rest);
                }
            }
        }
    }))
}
