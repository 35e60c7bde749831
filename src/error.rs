use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while admitting or processing a queued request.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("no active request to cancel")]
    NoActiveRequest,

    #[error("Stable Diffusion is not running")]
    BackendUnavailable,

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("processing timeout")]
    Timeout,

    #[error("request was canceled")]
    Canceled,

    #[error("waiting for image data timeout")]
    NoImage,

    #[error("got no image data")]
    EmptyImage,

    #[error("nothing to upload")]
    NothingToUpload,

    #[error("send images error: {0}")]
    Upload(NotifyError),

    #[error("image conversion error: {0}")]
    ImageConversion(#[from] image::ImageError),

    #[error("queue state lock poisoned: {0}")]
    Lock(String),

    #[error("{0}")]
    Other(String),
}

/// Errors returned by a render backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend refused the connection, usually because it has not
    /// finished starting up yet. This is the only retryable failure.
    #[error("connection refused by {endpoint}: {message}")]
    ConnectionRefused { endpoint: String, message: String },

    /// The backend returned a non-success HTTP status.
    #[error("api status code: {status} ({method} to {url})\nResponse body: {body}")]
    Http {
        status: u16,
        method: String,
        url: String,
        body: String,
    },

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Whether this failure means the backend is not reachable yet.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, BackendError::ConnectionRefused { .. })
    }
}

/// A failed chat transport call.
///
/// Transports that rate-limit (HTTP 429) attach the server's backoff hint so
/// the queue can wait it out before retrying.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct NotifyError {
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl NotifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Build an error from a transport error body, picking up a
    /// `"retry_after": N` hint if the body carries one.
    ///
    /// Both the structured form (`{"parameters":{"retry_after":N}}`) and a bare
    /// top-level `retry_after` field are recognised. Anything unparsable simply
    /// yields no hint.
    pub fn from_api_body(description: impl Into<String>, body: &str) -> Self {
        let mut err = Self::new(description);
        err.retry_after = parse_retry_after(body);
        err
    }
}

fn parse_retry_after(body: &str) -> Option<Duration> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let secs = json
            .pointer("/parameters/retry_after")
            .or_else(|| json.get("retry_after"))
            .and_then(|v| v.as_u64());
        if let Some(secs) = secs {
            return Some(Duration::from_secs(secs));
        }
    }

    // Error strings sometimes embed the JSON fragment inside other text.
    let start = body.find("\"retry_after\":")? + "\"retry_after\":".len();
    let digits: String = body[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, QueueError>;
