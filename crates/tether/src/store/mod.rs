//! Persistence seams for agents, OS sessions and the direct-message queue.
//!
//! Two implementations are provided: [`SqliteStore`] for the running hub and
//! [`MemoryStore`] for tests and ephemeral runs. Both enforce the same rules:
//!
//! - a remote session id is held by at most one agent; claiming it clears
//!   it from any previous holder;
//! - opening an OS session deactivates the agent's older ones;
//! - direct-queue status changes only follow [`DirectStatus::predecessors`].

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

use crate::agent::{AgentIdentity, AgentStatus, AgentType, InvocationCredential, OsSession, ProfileUpdate};
use crate::queue::{DirectQueueEntry, DirectStatus, QueueFilter};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a new agent or update the one with the same name (keeping its id).
    async fn upsert_agent(&self, agent: &AgentIdentity) -> StoreResult<AgentIdentity>;

    async fn get_agent(&self, name: &str) -> StoreResult<Option<AgentIdentity>>;

    async fn list_agents(&self) -> StoreResult<Vec<AgentIdentity>>;

    async fn set_status(&self, name: &str, status: AgentStatus) -> StoreResult<()>;

    async fn set_agent_type(&self, name: &str, agent_type: AgentType) -> StoreResult<()>;

    /// Bump `last_seen_at`.
    async fn touch(&self, name: &str) -> StoreResult<()>;

    async fn update_profile(&self, name: &str, update: &ProfileUpdate) -> StoreResult<AgentIdentity>;

    /// Attach a credential to `name`, clearing the same session id from every other agent.
    ///
    /// Returns the names of agents that lost the credential.
    async fn claim_credential(
        &self,
        name: &str,
        credential: &InvocationCredential,
    ) -> StoreResult<Vec<String>>;

    async fn clear_credential(&self, name: &str) -> StoreResult<()>;

    /// Session ids currently held by agents other than `except`.
    async fn claimed_session_ids(&self, except: &str) -> StoreResult<HashSet<String>>;

    async fn set_cli_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()>;

    async fn set_backend_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()>;
}

#[async_trait]
pub trait OsSessionStore: Send + Sync {
    /// Open a new active session for `agent_id`, deactivating any older ones.
    async fn open_os_session(&self, agent_id: &str, pid: u32, tty: &str) -> StoreResult<OsSession>;

    async fn active_os_session(&self, agent_id: &str) -> StoreResult<Option<OsSession>>;

    /// Deactivate all sessions of an agent. Returns how many were active.
    async fn close_os_sessions(&self, agent_id: &str) -> StoreResult<u64>;
}

#[async_trait]
pub trait DirectQueueStore: Send + Sync {
    async fn insert_direct(&self, entry: &DirectQueueEntry) -> StoreResult<()>;

    async fn get_direct(&self, id: &str) -> StoreResult<Option<DirectQueueEntry>>;

    /// Move `id` to `next` if its current status is one of `next.predecessors()`.
    ///
    /// Returns whether the write was applied.
    async fn transition_direct(
        &self,
        id: &str,
        next: DirectStatus,
        response: Option<&str>,
    ) -> StoreResult<bool>;

    /// Mark every pending entry for `to_agent` delivered and return them, oldest first.
    async fn take_pending_direct(&self, to_agent: &str) -> StoreResult<Vec<DirectQueueEntry>>;

    /// Expire pending/delivered entries created before `cutoff`. Returns how many changed.
    async fn expire_direct_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Newest first, limited by [`QueueFilter::effective_limit`].
    async fn list_direct(&self, filter: &QueueFilter) -> StoreResult<Vec<DirectQueueEntry>>;
}

/// Everything the hub needs from persistence.
pub trait Store: AgentStore + OsSessionStore + DirectQueueStore {}

impl<T: AgentStore + OsSessionStore + DirectQueueStore> Store for T {}
