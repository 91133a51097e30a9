//! Backends that carry a prompt to an agent CLI.
//!
//! Two paths exist: a persistent `opencode serve` instance owned by the
//! [`BackendSupervisor`], and one-shot CLI invocations run by the
//! [`SubprocessRunner`]. The [`Dispatcher`] picks between them.

pub mod dispatcher;
pub mod process;
pub mod subprocess;
pub mod supervisor;

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use dispatcher::{Dispatcher, PromptSender};
pub use process::{ChildProcess, OpenCodeLauncher, ServerLauncher, ServerProcess};
pub use subprocess::{DirectCommand, SubprocessRunner, build_direct_command, resolve_cli};
pub use supervisor::{BackendSnapshot, BackendSupervisor, SupervisorConfig, WatchdogOutcome};

/// Lifecycle state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Server,
    Subprocess,
}

/// Errors from backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("backend is not running")]
    NotRunning,

    #[error("{0} CLI not found")]
    CliNotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("backend failed to start: {0}")]
    StartFailed(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("cannot connect to backend: {0}")]
    Connect(String),

    #[error("process exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("{0} agents have no one-shot fallback")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of a delivered prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptOutcome {
    pub output: String,
    /// Remote session that handled the prompt, when the server path was used.
    pub session_id: Option<String>,
    pub backend: BackendKind,
    #[serde(with = "millis")]
    pub duration: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(BackendStatus::Running).unwrap(),
            serde_json::json!("running")
        );
        assert_eq!(BackendStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_outcome_duration_in_millis() {
        let outcome = PromptOutcome {
            output: "ok".into(),
            session_id: None,
            backend: BackendKind::Subprocess,
            duration: Duration::from_millis(1500),
        };
        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(value["duration"], 1500);
        assert_eq!(value["backend"], "subprocess");
    }
}
