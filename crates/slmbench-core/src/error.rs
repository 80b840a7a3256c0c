use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlmBenchError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Ollama error: {0}")]
    OllamaError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Cannot connect to Ollama: {0}")]
    Connection(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Empty response: stream ended before any chunk arrived")]
    EmptyResponse,

    #[error("Timeout: no complete response within {0:.1}s")]
    Timeout(f64),

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Comparison needs at least two model summaries, got {0}")]
    NotEnoughSummaries(usize),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SlmBenchError {
    /// Cancellation is never converted into a failed record.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SlmBenchError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SlmBenchError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SlmBenchError>;
