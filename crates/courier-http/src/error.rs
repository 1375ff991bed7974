//! HTTP errors.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HttpError>;

/// HTTP errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("upload failed: file [{}] {reason}", path.display())]
    FileNotFound { path: PathBuf, reason: String },

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `message` is the standard reason phrase for `code`, not the
    /// server's own wording.
    #[error("HTTP status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl HttpError {
    /// Whether this error belongs to the I/O class: connection failures,
    /// timeouts, cancellation and stream read/write failures.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            HttpError::Request(_) | HttpError::Timeout | HttpError::Cancelled | HttpError::Io(_)
        )
    }

    /// The HTTP status code carried by a [`HttpError::Status`].
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Request(e)
        }
    }
}
