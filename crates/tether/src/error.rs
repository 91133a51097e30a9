//! Error taxonomy shared by the routing core.

use thiserror::Error;

use crate::backend::BackendError;
use crate::opencode::OpenCodeError;
use crate::store::StoreError;

/// Result type for routing operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors surfaced by discovery, liveness, invocation and the direct queue.
///
/// `Unreachable` and `NotFound` are ordinary negative outcomes. `Timeout` and
/// `Backend` are transient and may be retried.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} is not reachable")]
    Unreachable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unreachable(agent: impl Into<String>) -> Self {
        Self::Unreachable(agent.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Whether a caller may retry the operation after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Backend(_))
    }
}

impl From<BackendError> for RelayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout(after) => Self::Timeout(format!("no reply within {after:?}")),
            BackendError::Conflict(msg) => Self::Conflict(msg),
            BackendError::CliNotFound(cli) => Self::NotFound(format!("{cli} CLI binary")),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<OpenCodeError> for RelayError {
    fn from(err: OpenCodeError) -> Self {
        match err {
            OpenCodeError::Timeout => Self::Timeout("opencode request".to_string()),
            OpenCodeError::SessionNotFound(id) => Self::NotFound(format!("remote session {id}")),
            other => Self::Backend(other.to_string()),
        }
    }
}
