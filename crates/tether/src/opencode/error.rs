//! OpenCode client error types.

use thiserror::Error;

pub type OpenCodeResult<T> = Result<T, OpenCodeError>;

#[derive(Debug, Error)]
pub enum OpenCodeError {
    /// The remote session does not exist (404 on a session route).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("request timed out")]
    Timeout,

    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("opencode returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("HTTP request failed: {0}")]
    Request(reqwest::Error),
}

impl OpenCodeError {
    /// Classify a transport error, keeping timeouts and refused connections distinct.
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OpenCodeError::Timeout
        } else if err.is_connect() {
            OpenCodeError::Connect {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else {
            OpenCodeError::Request(err)
        }
    }

    /// Whether the server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            OpenCodeError::Timeout | OpenCodeError::Connect { .. } | OpenCodeError::Request(_)
        )
    }
}
