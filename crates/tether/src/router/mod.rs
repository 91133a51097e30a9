//! Invocation router.
//!
//! Decides who a chat message should wake up, resolves a live session for
//! each recipient and pushes the prompt without blocking the caller. Direct
//! messages with a reply go through the [`DirectQueue`] instead.

pub mod prompt;

use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::agent::service::claim_and_notify;
use crate::agent::{AgentIdentity, AgentType, InvocationCredential};
use crate::discovery::{DiscoveryHints, DiscoveryResolver};
use crate::error::RelayResult;
use crate::events::{EventSink, HubEvent};
use crate::liveness::LivenessOracle;
use crate::opencode::{OpenCodeClient, OpenCodeError};
use crate::queue::{DirectMode, DirectOutcome, DirectQueue, DirectQueueEntry, QueueFilter};
use crate::store::Store;

/// A chat message that may invoke agents.
#[derive(Debug, Clone, Deserialize)]
pub struct InvocationRequest {
    pub sender: String,
    pub channel_id: String,
    pub channel_name: String,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    /// Recent channel messages, rendered one per line.
    #[serde(default)]
    pub recent_context: Option<String>,
}

/// Who a message is delivered to: the DM target plus mentions, without the
/// sender, each name once.
pub fn recipients(sender: &str, channel_name: &str, mentions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let dm = prompt::dm_target(channel_name);
    for name in dm.iter().chain(mentions.iter()) {
        let name = name.trim().trim_start_matches('@');
        if name.is_empty() || name == sender || out.iter().any(|n| n == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

pub struct InvocationRouter {
    store: Arc<dyn Store>,
    oracle: Arc<LivenessOracle>,
    resolver: Arc<DiscoveryResolver>,
    events: Arc<dyn EventSink>,
    queue: Arc<DirectQueue>,
    http: reqwest::Client,
    prompt_timeout: Duration,
    tracker: TaskTracker,
}

impl InvocationRouter {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<LivenessOracle>,
        resolver: Arc<DiscoveryResolver>,
        events: Arc<dyn EventSink>,
        queue: Arc<DirectQueue>,
        http: reqwest::Client,
        prompt_timeout: Duration,
    ) -> Self {
        Self {
            store,
            oracle,
            resolver,
            events,
            queue,
            http,
            prompt_timeout,
            tracker: TaskTracker::new(),
        }
    }

    pub fn queue(&self) -> &Arc<DirectQueue> {
        &self.queue
    }

    /// Fan a chat message out to its recipients in the background.
    ///
    /// Returns the recipients a delivery was started for. Outcomes are only
    /// observable as events.
    pub fn invoke(self: &Arc<Self>, request: InvocationRequest) -> Vec<String> {
        let targets = recipients(&request.sender, &request.channel_name, &request.mentions);
        if targets.is_empty() {
            debug!(
                "message from {} in {} has no recipients",
                request.sender, request.channel_name
            );
            return targets;
        }
        info!(
            "invoking {:?} for message from {} in {}",
            targets, request.sender, request.channel_name
        );

        let dm = prompt::dm_target(&request.channel_name);
        let request = Arc::new(request);
        for name in &targets {
            // Mentions carry recent channel context; the DM target does not.
            let context = if dm.as_deref() == Some(name.as_str()) {
                None
            } else {
                request.recent_context.as_deref()
            };
            let text = prompt::invocation_prompt(
                &request.sender,
                &request.channel_name,
                &request.content,
                context,
            );
            let router = Arc::clone(self);
            let request = Arc::clone(&request);
            let name = name.clone();
            self.tracker.spawn(async move {
                router.deliver(&name, &request.channel_id, &text).await;
            });
        }
        targets
    }

    /// Deliver to one recipient. Never fails; the result is an event.
    async fn deliver(&self, name: &str, channel_id: &str, text: &str) {
        let agent = match self.store.get_agent(name).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                debug!("{} is not a registered agent", name);
                self.unreachable(name, channel_id);
                return;
            }
            Err(e) => {
                warn!("cannot load agent {}: {}", name, e);
                return;
            }
        };
        if agent.agent_type == AgentType::System {
            debug!("not invoking system agent {}", name);
            return;
        }

        match self.oracle.is_ghost_agent(&agent).await {
            Ok(true) => {
                if agent.credential.is_some() {
                    self.clear_stale(&agent.name).await;
                }
                info!("{} is a ghost, skipping", name);
                self.unreachable(name, channel_id);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!("ghost check for {} failed: {}", name, e),
        }

        self.events.notify(HubEvent::TypingStarted {
            agent: name.to_string(),
            channel_id: channel_id.to_string(),
        });
        let error = match self.resolve_credential(name).await {
            Ok(Some(credential)) => self.send(&agent, &credential, text).await.err(),
            Ok(None) => Some(format!("{name} is not reachable")),
            Err(e) => {
                warn!("credential lookup for {} failed: {}", name, e);
                Some(format!("{name} is not reachable"))
            }
        };
        if let Some(message) = &error {
            warn!("invocation of {} failed: {}", name, message);
        }
        self.events.notify(HubEvent::TypingStopped {
            agent: name.to_string(),
            channel_id: channel_id.to_string(),
            error,
        });
    }

    /// `prompt_async` into the agent's session. Errors are user-facing strings.
    async fn send(
        &self,
        agent: &AgentIdentity,
        credential: &InvocationCredential,
        text: &str,
    ) -> Result<(), String> {
        let client = OpenCodeClient::with_client(self.http.clone(), &credential.server_url);
        match client
            .prompt_async(&credential.session_id, text, self.prompt_timeout)
            .await
        {
            Ok(()) => {
                info!("invoked {} (session {})", agent.name, credential.session_id);
                Ok(())
            }
            Err(OpenCodeError::SessionNotFound(_)) => {
                self.clear_stale(&agent.name).await;
                Err(format!("{} is not reachable", agent.name))
            }
            Err(OpenCodeError::Timeout) => Err(format!(
                "{} did not accept the message within {:?}",
                agent.name, self.prompt_timeout
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    fn unreachable(&self, name: &str, channel_id: &str) {
        self.events.notify(HubEvent::AgentUnreachable {
            agent: name.to_string(),
            channel_id: channel_id.to_string(),
        });
    }

    async fn clear_stale(&self, name: &str) {
        match self.store.clear_credential(name).await {
            Ok(()) => {
                info!("cleared stale credential of {}", name);
                self.events.notify(HubEvent::CredentialUpdated {
                    agent: name.to_string(),
                    credential: None,
                });
            }
            Err(e) => warn!("failed to clear credential of {}: {}", name, e),
        }
    }

    /// A live credential for `name`: the stored one if its session is still
    /// listed, otherwise whatever discovery finds (which is then claimed).
    pub async fn resolve_credential(
        &self,
        name: &str,
    ) -> RelayResult<Option<InvocationCredential>> {
        let Some(agent) = self.store.get_agent(name).await? else {
            return Ok(None);
        };
        if agent.agent_type == AgentType::System {
            return Ok(None);
        }
        if let Some(credential) = &agent.credential {
            if self.oracle.check_credential(credential).await {
                return Ok(Some(credential.clone()));
            }
            self.clear_stale(name).await;
        }

        let mut hints = DiscoveryHints::for_project(agent.project_path.clone());
        if let Some(os) = self.store.active_os_session(&agent.id).await? {
            hints.pid = Some(os.pid);
            hints.tty = Some(os.tty).filter(|t| !t.is_empty());
        }
        hints.exclude = self.store.claimed_session_ids(name).await?;

        let Some(credential) = self.resolver.discover(hints).await else {
            debug!("no session discovered for {}", name);
            return Ok(None);
        };
        self.claim(name, &credential).await?;
        Ok(Some(credential))
    }

    /// Persist a credential for `name`, notifying every agent that lost it.
    pub async fn claim(&self, name: &str, credential: &InvocationCredential) -> RelayResult<()> {
        claim_and_notify(self.store.as_ref(), self.events.as_ref(), name, credential).await
    }

    pub async fn is_ghost(&self, name: &str) -> RelayResult<bool> {
        Ok(self.oracle.is_ghost(name).await?)
    }

    pub async fn is_invocable(&self, name: &str) -> RelayResult<bool> {
        Ok(self.resolve_credential(name).await?.is_some())
    }

    pub async fn enqueue_direct(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> RelayResult<DirectQueueEntry> {
        self.queue.enqueue_direct(from, to, text).await
    }

    pub async fn direct_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        mode: DirectMode,
        timeout: Option<Duration>,
    ) -> RelayResult<DirectOutcome> {
        self.queue.direct_message(from, to, text, mode, timeout).await
    }

    pub async fn respond_direct(
        &self,
        entry_id: &str,
        responder: &str,
        response: &str,
    ) -> RelayResult<DirectQueueEntry> {
        self.queue.respond_direct(entry_id, responder, response).await
    }

    pub async fn queue_status(&self, filter: &QueueFilter) -> RelayResult<Vec<DirectQueueEntry>> {
        self.queue.queue_status(filter).await
    }

    /// Number of deliveries still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work and wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for in-flight deliveries, then keep accepting new ones.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
