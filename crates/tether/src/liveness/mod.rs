//! Liveness and ghost detection.
//!
//! An agent is a *ghost* when it is registered but nothing is behind it. The
//! [`LivenessOracle`] answers synchronously and errs towards "dead" when a
//! backend cannot be reached; the [`GhostCache`] refreshes a display map in the
//! background and errs towards "alive" on the same failure.

mod cache;

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentIdentity, AgentType, InvocationCredential};
use crate::discovery::pid_alive;
use crate::opencode::{OpenCodeClient, OpenCodeError};
use crate::store::{Store, StoreResult};

pub use cache::GhostCache;

/// Answers whether a local pid is running.
pub trait PidProbe: Send + Sync {
    fn alive(&self, pid: u32) -> bool;
}

/// [`PidProbe`] using `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl PidProbe for SignalProbe {
    fn alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }
}

/// Result of asking a backend for its session list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionListing {
    Listed(HashSet<String>),
    /// The server answered with a non-success status.
    ServerError(u16),
    Unreachable,
}

impl SessionListing {
    /// Invocation-path reading: an unreachable backend counts as dead.
    pub fn strict_contains(&self, session_id: &str) -> bool {
        match self {
            SessionListing::Listed(ids) => ids.contains(session_id),
            SessionListing::ServerError(_) => true,
            SessionListing::Unreachable => false,
        }
    }

    /// Display reading: anything short of a definite absence counts as alive.
    pub fn lenient_contains(&self, session_id: &str) -> bool {
        match self {
            SessionListing::Listed(ids) => ids.contains(session_id),
            SessionListing::ServerError(_) | SessionListing::Unreachable => true,
        }
    }
}

/// Decides whether agents are reachable.
pub struct LivenessOracle {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    probe: Arc<dyn PidProbe>,
    timeout: Duration,
}

impl LivenessOracle {
    pub fn new(
        store: Arc<dyn Store>,
        http: reqwest::Client,
        probe: Arc<dyn PidProbe>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            http,
            probe,
            timeout,
        }
    }

    /// One `GET /session` against `server_url`.
    pub async fn list_sessions(&self, server_url: &str) -> SessionListing {
        let client = OpenCodeClient::with_client(self.http.clone(), server_url);
        match client.list_sessions(self.timeout).await {
            Ok(sessions) => SessionListing::Listed(sessions.into_iter().map(|s| s.id).collect()),
            Err(OpenCodeError::Status { status, .. }) => {
                debug!("{} answered {} to session listing", server_url, status);
                SessionListing::ServerError(status)
            }
            Err(e) => {
                debug!("{} unreachable: {}", server_url, e);
                SessionListing::Unreachable
            }
        }
    }

    /// Whether the credential's session is still listed by its backend.
    ///
    /// Fails towards dead: callers clear the credential and re-discover.
    pub async fn check_credential(&self, credential: &InvocationCredential) -> bool {
        let alive = self
            .list_sessions(&credential.server_url)
            .await
            .strict_contains(&credential.session_id);
        if !alive {
            info!(
                "session {} on {} is dead",
                credential.session_id, credential.server_url
            );
        }
        alive
    }

    /// Whether the agent's active OS session has a running pid.
    pub async fn os_session_alive(&self, agent: &AgentIdentity) -> StoreResult<bool> {
        Ok(self
            .store
            .active_os_session(&agent.id)
            .await?
            .is_some_and(|s| s.is_active && self.probe.alive(s.pid)))
    }

    /// Synchronous ghost check for the invocation path.
    pub async fn is_ghost(&self, name: &str) -> StoreResult<bool> {
        let Some(agent) = self.store.get_agent(name).await? else {
            debug!("{} is unknown, not a ghost", name);
            return Ok(false);
        };
        self.is_ghost_agent(&agent).await
    }

    pub async fn is_ghost_agent(&self, agent: &AgentIdentity) -> StoreResult<bool> {
        if agent.agent_type == AgentType::System {
            return Ok(false);
        }
        if let Some(credential) = &agent.credential {
            return Ok(!self.check_credential(credential).await);
        }
        let ghost = !self.os_session_alive(agent).await?;
        debug!("{} has no credential; ghost={}", agent.name, ghost);
        Ok(ghost)
    }

    pub fn probe(&self) -> &Arc<dyn PidProbe> {
        &self.probe
    }
}
