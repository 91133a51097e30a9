//! In-memory store for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::{AgentStore, DirectQueueStore, OsSessionStore, StoreError, StoreResult};
use crate::agent::{AgentIdentity, AgentStatus, AgentType, InvocationCredential, OsSession, ProfileUpdate};
use crate::queue::{DirectQueueEntry, DirectStatus, QueueFilter};

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by agent name.
    agents: HashMap<String, AgentIdentity>,
    os_sessions: Vec<OsSession>,
    queue: HashMap<String, DirectQueueEntry>,
}

/// Store backed by a single lock over plain collections.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn agent_mut(&mut self, name: &str) -> StoreResult<&mut AgentIdentity> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| StoreError::AgentNotFound(name.to_string()))
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn upsert_agent(&self, agent: &AgentIdentity) -> StoreResult<AgentIdentity> {
        let mut inner = self.inner.write().await;
        let mut stored = agent.clone();
        if let Some(existing) = inner.agents.get(&agent.name) {
            stored.id = existing.id.clone();
            stored.created_at = existing.created_at;
        }
        inner.agents.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_agent(&self, name: &str) -> StoreResult<Option<AgentIdentity>> {
        Ok(self.inner.read().await.agents.get(name).cloned())
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentIdentity>> {
        let inner = self.inner.read().await;
        let mut agents: Vec<_> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(agents)
    }

    async fn set_status(&self, name: &str, status: AgentStatus) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.status = status;
        Ok(())
    }

    async fn set_agent_type(&self, name: &str, agent_type: AgentType) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.agent_type = agent_type;
        Ok(())
    }

    async fn touch(&self, name: &str) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.last_seen_at = Utc::now();
        Ok(())
    }

    async fn update_profile(&self, name: &str, update: &ProfileUpdate) -> StoreResult<AgentIdentity> {
        let mut inner = self.inner.write().await;
        let agent = inner.agent_mut(name)?;
        agent.profile.apply(update);
        Ok(agent.clone())
    }

    async fn claim_credential(
        &self,
        name: &str,
        credential: &InvocationCredential,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(name) {
            return Err(StoreError::AgentNotFound(name.to_string()));
        }

        let mut cleared = Vec::new();
        for (other, agent) in inner.agents.iter_mut() {
            if other == name {
                continue;
            }
            let holds = agent
                .credential
                .as_ref()
                .is_some_and(|c| c.session_id == credential.session_id);
            if holds {
                agent.credential = None;
                cleared.push(other.clone());
            }
        }
        inner.agent_mut(name)?.credential = Some(credential.clone());
        cleared.sort();
        Ok(cleared)
    }

    async fn clear_credential(&self, name: &str) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.credential = None;
        Ok(())
    }

    async fn claimed_session_ids(&self, except: &str) -> StoreResult<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .agents
            .values()
            .filter(|a| a.name != except)
            .filter_map(|a| a.credential.as_ref().map(|c| c.session_id.clone()))
            .collect())
    }

    async fn set_cli_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.cli_session_id = session_id.map(str::to_string);
        Ok(())
    }

    async fn set_backend_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()> {
        self.inner.write().await.agent_mut(name)?.backend_session_id =
            session_id.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl OsSessionStore for MemoryStore {
    async fn open_os_session(&self, agent_id: &str, pid: u32, tty: &str) -> StoreResult<OsSession> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for session in inner.os_sessions.iter_mut() {
            if session.agent_id == agent_id && session.is_active {
                session.is_active = false;
                session.ended_at = Some(now);
            }
        }
        let session = OsSession {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            pid,
            tty: tty.to_string(),
            is_active: true,
            started_at: now,
            ended_at: None,
        };
        inner.os_sessions.push(session.clone());
        Ok(session)
    }

    async fn active_os_session(&self, agent_id: &str) -> StoreResult<Option<OsSession>> {
        let inner = self.inner.read().await;
        Ok(inner
            .os_sessions
            .iter()
            .rev()
            .find(|s| s.agent_id == agent_id && s.is_active)
            .cloned())
    }

    async fn close_os_sessions(&self, agent_id: &str) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut closed = 0;
        for session in inner.os_sessions.iter_mut() {
            if session.agent_id == agent_id && session.is_active {
                session.is_active = false;
                session.ended_at = Some(now);
                closed += 1;
            }
        }
        Ok(closed)
    }
}

#[async_trait]
impl DirectQueueStore for MemoryStore {
    async fn insert_direct(&self, entry: &DirectQueueEntry) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .queue
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_direct(&self, id: &str) -> StoreResult<Option<DirectQueueEntry>> {
        Ok(self.inner.read().await.queue.get(id).cloned())
    }

    async fn transition_direct(
        &self,
        id: &str,
        next: DirectStatus,
        response: Option<&str>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(match inner.queue.get_mut(id) {
            Some(entry) => entry.transition(next, response),
            None => false,
        })
    }

    async fn take_pending_direct(&self, to_agent: &str) -> StoreResult<Vec<DirectQueueEntry>> {
        let mut inner = self.inner.write().await;
        let mut taken: Vec<DirectQueueEntry> = inner
            .queue
            .values_mut()
            .filter(|e| e.to_agent == to_agent && e.status == DirectStatus::Pending)
            .map(|e| {
                e.transition(DirectStatus::Delivered, None);
                e.clone()
            })
            .collect();
        taken.sort_by_key(|e| e.created_at);
        Ok(taken)
    }

    async fn expire_direct_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let mut expired = 0;
        for entry in inner.queue.values_mut() {
            if entry.created_at < cutoff && entry.transition(DirectStatus::Expired, None) {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_direct(&self, filter: &QueueFilter) -> StoreResult<Vec<DirectQueueEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<_> = inner
            .queue
            .values()
            .filter(|e| filter.to_agent.as_deref().is_none_or(|to| e.to_agent == to))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(filter.effective_limit() as usize);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for name in ["nibex", "yara"] {
            store
                .upsert_agent(&AgentIdentity::new(name, AgentType::Opencode, "/tmp/proj"))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_claim_clears_previous_holder() {
        let store = seeded().await;
        let cred = InvocationCredential::new("http://127.0.0.1:4096", "ses_abc");

        assert!(store.claim_credential("nibex", &cred).await.unwrap().is_empty());
        let cleared = store.claim_credential("yara", &cred).await.unwrap();
        assert_eq!(cleared, vec!["nibex".to_string()]);

        let nibex = store.get_agent("nibex").await.unwrap().unwrap();
        let yara = store.get_agent("yara").await.unwrap().unwrap();
        assert!(nibex.credential.is_none());
        assert_eq!(yara.credential, Some(cred));
    }

    #[tokio::test]
    async fn test_upsert_keeps_id() {
        let store = seeded().await;
        let before = store.get_agent("nibex").await.unwrap().unwrap();
        let again = store
            .upsert_agent(&AgentIdentity::new("nibex", AgentType::Claude, "/tmp/other"))
            .await
            .unwrap();
        assert_eq!(before.id, again.id);
        assert_eq!(again.agent_type, AgentType::Claude);
    }

    #[tokio::test]
    async fn test_open_session_deactivates_older() {
        let store = MemoryStore::new();
        let first = store.open_os_session("a1", 100, "/dev/pts/1").await.unwrap();
        let second = store.open_os_session("a1", 200, "/dev/pts/2").await.unwrap();
        let active = store.active_os_session("a1").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_ne!(active.id, first.id);
        assert_eq!(store.close_os_sessions("a1").await.unwrap(), 1);
        assert!(store.active_os_session("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_take_pending_marks_delivered_once() {
        let store = MemoryStore::new();
        let entry = DirectQueueEntry::new("yara", "nibex", "ping", "ping");
        store.insert_direct(&entry).await.unwrap();

        let taken = store.take_pending_direct("nibex").await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].status, DirectStatus::Delivered);
        assert!(store.take_pending_direct("nibex").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_skips_terminal_entries() {
        let store = MemoryStore::new();
        let done = DirectQueueEntry::new("yara", "nibex", "a", "a");
        let open = DirectQueueEntry::new("yara", "nibex", "b", "b");
        store.insert_direct(&done).await.unwrap();
        store.insert_direct(&open).await.unwrap();
        store
            .transition_direct(&done.id, DirectStatus::Responded, Some("ok"))
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.expire_direct_before(cutoff).await.unwrap(), 1);
        let done = store.get_direct(&done.id).await.unwrap().unwrap();
        assert_eq!(done.status, DirectStatus::Responded);
    }
}
