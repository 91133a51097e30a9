//! Periodically refreshed ghost map for display.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{LivenessOracle, SessionListing};
use crate::agent::AgentType;
use crate::store::{Store, StoreResult};

struct RefreshLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Agent name → ghost flag, rebuilt on an interval.
///
/// Unreachable backends are treated as alive here; the map is cosmetic and
/// must not flap when a server is briefly down. The invocation path uses
/// [`LivenessOracle::is_ghost`] instead.
pub struct GhostCache {
    oracle: Arc<LivenessOracle>,
    store: Arc<dyn Store>,
    interval: Duration,
    ghosts: RwLock<HashMap<String, bool>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
    task: Mutex<Option<RefreshLoop>>,
}

impl GhostCache {
    pub fn new(oracle: Arc<LivenessOracle>, store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            oracle,
            store,
            interval,
            ghosts: RwLock::new(HashMap::new()),
            refreshed_at: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Cached flag for `name`; `None` until the first refresh has seen the agent.
    pub async fn get(&self, name: &str) -> Option<bool> {
        self.ghosts.read().await.get(name).copied()
    }

    pub async fn snapshot(&self) -> HashMap<String, bool> {
        self.ghosts.read().await.clone()
    }

    pub async fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.refreshed_at.read().await
    }

    /// Rebuild the map.
    ///
    /// Makes at most one session-list call per distinct backend URL. Agents whose
    /// check fails keep their previous value. Returns the number of ghosts.
    pub async fn refresh(&self) -> StoreResult<usize> {
        let agents = self.store.list_agents().await?;

        let urls: HashSet<&str> = agents
            .iter()
            .filter_map(|a| a.credential.as_ref().map(|c| c.server_url.as_str()))
            .collect();
        let listings: HashMap<&str, SessionListing> =
            futures::future::join_all(urls.into_iter().map(|url| async move {
                (url, self.oracle.list_sessions(url).await)
            }))
            .await
            .into_iter()
            .collect();

        let previous = self.snapshot().await;
        let mut next = HashMap::with_capacity(agents.len());
        for agent in &agents {
            let ghost = if agent.agent_type == AgentType::System {
                Some(false)
            } else if let Some(cred) = &agent.credential {
                listings
                    .get(cred.server_url.as_str())
                    .map(|listing| !listing.lenient_contains(&cred.session_id))
            } else {
                match self.oracle.os_session_alive(agent).await {
                    Ok(alive) => Some(!alive),
                    Err(e) => {
                        warn!("ghost check for {} failed: {}", agent.name, e);
                        previous.get(&agent.name).copied()
                    }
                }
            };
            if let Some(ghost) = ghost {
                next.insert(agent.name.clone(), ghost);
            }
        }

        let ghosts = next.values().filter(|g| **g).count();
        *self.ghosts.write().await = next;
        *self.refreshed_at.write().await = Some(Utc::now());
        debug!("ghost cache refreshed: {} agents, {} ghosts", agents.len(), ghosts);
        Ok(ghosts)
    }

    /// Start the background refresh loop. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = cache.refresh().await {
                            warn!("ghost cache refresh failed: {}", e);
                        }
                    }
                }
            }
            debug!("ghost cache loop stopped");
        });
        info!("ghost cache refreshing every {:?}", self.interval);
        *task = Some(RefreshLoop { cancel, handle });
    }

    /// Cancel the refresh loop and wait for it to finish.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("ghost cache loop ended abnormally: {}", e);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FixedProbe;
    use super::*;
    use crate::agent::{AgentIdentity, InvocationCredential};
    use crate::opencode::test_server::{self, FakeState};
    use crate::store::{AgentStore, MemoryStore, OsSessionStore};
    use serde_json::json;

    async fn cache_with(store: Arc<MemoryStore>) -> Arc<GhostCache> {
        let oracle = Arc::new(LivenessOracle::new(
            store.clone(),
            reqwest::Client::new(),
            Arc::new(FixedProbe::with(&[7])),
            Duration::from_secs(2),
        ));
        Arc::new(GhostCache::new(oracle, store, Duration::from_millis(20)))
    }

    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_refresh_classifies_agents() {
        let state = Arc::new(std::sync::Mutex::new(FakeState {
            healthy: true,
            sessions: vec![json!({"id": "ses_live"})],
            ..Default::default()
        }));
        let url = test_server::spawn(state).await;
        let store = Arc::new(MemoryStore::new());

        let mut live = AgentIdentity::new("live", AgentType::Opencode, "/p");
        live.credential = Some(InvocationCredential::new(url.clone(), "ses_live"));
        let mut stale = AgentIdentity::new("stale", AgentType::Opencode, "/p");
        stale.credential = Some(InvocationCredential::new(url, "ses_gone"));
        let mut offline_server = AgentIdentity::new("far", AgentType::Opencode, "/p");
        offline_server.credential = Some(InvocationCredential::new(dead_url(), "ses_x"));
        let local = store
            .upsert_agent(&AgentIdentity::new("local", AgentType::Claude, "/p"))
            .await
            .unwrap();
        store.open_os_session(&local.id, 7, "").await.unwrap();
        for agent in [&live, &stale, &offline_server] {
            store.upsert_agent(agent).await.unwrap();
        }
        store
            .upsert_agent(&AgentIdentity::new("sys", AgentType::System, "/"))
            .await
            .unwrap();

        let cache = cache_with(store).await;
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert_eq!(cache.get("live").await, Some(false));
        assert_eq!(cache.get("stale").await, Some(true));
        assert_eq!(cache.get("far").await, Some(false));
        assert_eq!(cache.get("local").await, Some(false));
        assert_eq!(cache.get("sys").await, Some(false));
        assert!(cache.refreshed_at().await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_lists_each_server_once() {
        let state = Arc::new(std::sync::Mutex::new(FakeState {
            healthy: true,
            sessions: vec![json!({"id": "ses_a"}), json!({"id": "ses_b"})],
            ..Default::default()
        }));
        let url = test_server::spawn(state.clone()).await;
        let store = Arc::new(MemoryStore::new());
        for (name, session) in [("yara", "ses_a"), ("nibex", "ses_b"), ("quill", "ses_gone")] {
            let mut agent = AgentIdentity::new(name, AgentType::Opencode, "/p");
            agent.credential = Some(InvocationCredential::new(url.clone(), session));
            store.upsert_agent(&agent).await.unwrap();
        }

        let cache = cache_with(store).await;
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert_eq!(state.lock().unwrap().listed, 1);
        assert_eq!(cache.get("quill").await, Some(true));

        cache.refresh().await.unwrap();
        assert_eq!(state.lock().unwrap().listed, 2);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_agent(&AgentIdentity::new("yara", AgentType::Codex, "/p"))
            .await
            .unwrap();
        let cache = cache_with(store).await;

        cache.start().await;
        cache.start().await;
        assert!(cache.is_running().await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("yara").await, Some(true));

        cache.stop().await;
        assert!(!cache.is_running().await);
    }
}
