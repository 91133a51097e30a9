//! Agent registration and presence.

use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;

use super::models::{AgentIdentity, AgentStatus, AgentType, InvocationCredential, ProfileUpdate};
use crate::discovery::{DiscoveryHints, DiscoveryResolver};
use crate::error::{RelayError, RelayResult};
use crate::events::{EventSink, HubEvent};
use crate::store::Store;

/// Registration of a logical agent by a local process.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub project_path: String,
    pub pid: u32,
    #[serde(default)]
    pub tty: String,
    #[serde(default)]
    pub credential: Option<InvocationCredential>,
    #[serde(default)]
    pub profile: Option<ProfileUpdate>,
}

/// Attach `credential` to `name` and announce every holder change.
pub(crate) async fn claim_and_notify(
    store: &dyn Store,
    events: &dyn EventSink,
    name: &str,
    credential: &InvocationCredential,
) -> RelayResult<()> {
    let cleared = store.claim_credential(name, credential).await?;
    for other in cleared {
        info!(
            "session {} moved from {} to {}",
            credential.session_id, other, name
        );
        events.notify(HubEvent::CredentialUpdated {
            agent: other,
            credential: None,
        });
    }
    events.notify(HubEvent::CredentialUpdated {
        agent: name.to_string(),
        credential: Some(credential.clone()),
    });
    Ok(())
}

pub struct AgentService {
    store: Arc<dyn Store>,
    resolver: Arc<DiscoveryResolver>,
    events: Arc<dyn EventSink>,
}

impl AgentService {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<DiscoveryResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            resolver,
            events,
        }
    }

    /// Register (or re-register) an agent and bind it to a fresh OS session.
    pub async fn register(&self, req: RegisterRequest) -> RelayResult<AgentIdentity> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(RelayError::rejected("agent name must not be empty"));
        }

        let mut identity = AgentIdentity::new(name, req.agent_type, req.project_path.clone());
        // A new process means a new remote session; resume ids and profile survive.
        if let Some(existing) = self.store.get_agent(name).await? {
            identity.profile = existing.profile;
            identity.cli_session_id = existing.cli_session_id;
            identity.backend_session_id = existing.backend_session_id;
        }
        if let Some(update) = &req.profile {
            identity.profile.apply(update);
        }
        let stored = self.store.upsert_agent(&identity).await?;
        info!(
            "registered {} ({}, {})",
            stored.name, stored.agent_type, stored.project_path
        );

        self.bind(&stored, req.pid, &req.tty, req.credential).await?;
        self.load(name).await
    }

    /// Re-attach an existing identity to a new process.
    pub async fn connect(
        &self,
        name: &str,
        pid: u32,
        tty: &str,
        credential: Option<InvocationCredential>,
    ) -> RelayResult<AgentIdentity> {
        let agent = self.load(name).await?;
        self.store.set_status(name, AgentStatus::Online).await?;
        self.bind(&agent, pid, tty, credential).await?;
        info!("{} connected (pid {})", name, pid);
        self.load(name).await
    }

    pub async fn disconnect(&self, name: &str) -> RelayResult<AgentIdentity> {
        let agent = self.load(name).await?;
        self.store.set_status(name, AgentStatus::Offline).await?;
        let closed = self.store.close_os_sessions(&agent.id).await?;
        info!("{} disconnected ({} session(s) closed)", name, closed);
        self.load(name).await
    }

    pub async fn heartbeat(&self, name: &str) -> RelayResult<()> {
        self.load(name).await?;
        self.store.touch(name).await?;
        Ok(())
    }

    pub async fn update_profile(
        &self,
        name: &str,
        update: &ProfileUpdate,
    ) -> RelayResult<AgentIdentity> {
        self.load(name).await?;
        Ok(self.store.update_profile(name, update).await?)
    }

    pub async fn get(&self, name: &str) -> RelayResult<Option<AgentIdentity>> {
        Ok(self.store.get_agent(name).await?)
    }

    pub async fn list(&self) -> RelayResult<Vec<AgentIdentity>> {
        Ok(self.store.list_agents().await?)
    }

    async fn load(&self, name: &str) -> RelayResult<AgentIdentity> {
        self.store
            .get_agent(name)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("agent {name}")))
    }

    /// Rotate the OS session, then attach the supplied or discovered credential.
    async fn bind(
        &self,
        agent: &AgentIdentity,
        pid: u32,
        tty: &str,
        credential: Option<InvocationCredential>,
    ) -> RelayResult<()> {
        self.store.open_os_session(&agent.id, pid, tty).await?;
        if agent.agent_type == AgentType::System {
            return Ok(());
        }

        let credential = match credential {
            Some(credential) => Some(credential),
            None => self.discover(agent, pid, tty).await?,
        };
        let Some(credential) = credential else {
            debug!("no live session found for {}", agent.name);
            return Ok(());
        };

        claim_and_notify(self.store.as_ref(), self.events.as_ref(), &agent.name, &credential)
            .await?;
        if agent.agent_type != AgentType::Opencode {
            // Only OpenCode servers expose sessions we can discover or invoke.
            info!(
                "{} registered as {} runs on an opencode server, retyping",
                agent.name, agent.agent_type
            );
            if let Err(e) = self.store.set_agent_type(&agent.name, AgentType::Opencode).await {
                warn!("failed to retype {}: {}", agent.name, e);
            }
        }
        Ok(())
    }

    async fn discover(
        &self,
        agent: &AgentIdentity,
        pid: u32,
        tty: &str,
    ) -> RelayResult<Option<InvocationCredential>> {
        let mut hints = DiscoveryHints::for_project(agent.project_path.clone());
        hints.pid = Some(pid).filter(|p| *p > 0);
        hints.tty = Some(tty.to_string()).filter(|t| !t.is_empty());
        hints.exclude = self.store.claimed_session_ids(&agent.name).await?;
        Ok(self.resolver.discover(hints).await)
    }
}
