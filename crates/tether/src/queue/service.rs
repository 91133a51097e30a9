//! Direct-message delivery.
//!
//! A direct message is first queued for *smart pull*: the recipient picks it
//! up piggy-backed on its next request to the hub and answers with
//! [`DirectQueue::respond_direct`]. When no answer arrives in time the
//! message is pushed through a backend instead. A reply that lands while the
//! backend call is still running wins over the backend's output.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::models::{DirectQueueEntry, DirectStatus, QueueFilter};
use crate::backend::{BackendError, BackendKind, PromptSender};
use crate::discovery::RegistrySet;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventSink, HubEvent};
use crate::router::prompt;
use crate::store::Store;

/// How a direct message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectMode {
    /// Smart pull, then backend fallback.
    #[default]
    Auto,
    /// Smart pull only; the message stays queued on timeout.
    SmartPull,
    /// Straight to the backend.
    Subprocess,
}

#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub poll_interval: Duration,
    /// How long `auto` waits for a smart-pull reply.
    pub smart_pull_wait: Duration,
    pub fallback_timeout: Duration,
    /// Unanswered entries older than this expire.
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            smart_pull_wait: Duration::from_secs(45),
            fallback_timeout: Duration::from_secs(180),
            max_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Where a direct message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    SmartPull,
    Fallback,
    /// Still queued for smart pull.
    Pending,
    Expired,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectOutcome {
    pub entry_id: String,
    pub to_agent: String,
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
}

impl DirectOutcome {
    fn new(entry: &DirectQueueEntry, resolution: Resolution) -> Self {
        Self {
            entry_id: entry.id.clone(),
            to_agent: entry.to_agent.clone(),
            resolution,
            output: None,
            error: None,
            backend: None,
        }
    }

    fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Late-reply slot of one entry. Dropping it closes the slot, so an abandoned
/// fallback does not keep accepting replies.
struct LateReplySlot<'a> {
    slots: &'a DashMap<String, Option<String>>,
    id: String,
}

impl<'a> LateReplySlot<'a> {
    fn open(slots: &'a DashMap<String, Option<String>>, id: &str) -> Self {
        slots.insert(id.to_string(), None);
        Self {
            slots,
            id: id.to_string(),
        }
    }

    /// Close the slot and return the reply recorded in it, if any.
    fn close(self) -> Option<String> {
        self.slots.remove(&self.id).and_then(|(_, reply)| reply)
    }
}

impl Drop for LateReplySlot<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}

struct SweepLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Queue of direct messages between agents.
pub struct DirectQueue {
    store: Arc<dyn Store>,
    sender: Arc<dyn PromptSender>,
    registries: Arc<RegistrySet>,
    events: Arc<dyn EventSink>,
    config: DirectConfig,
    /// Entries with a backend fallback in flight, and the smart-pull reply
    /// that arrived meanwhile, if any.
    late_replies: DashMap<String, Option<String>>,
    sweeper: Mutex<Option<SweepLoop>>,
}

impl DirectQueue {
    pub fn new(
        store: Arc<dyn Store>,
        sender: Arc<dyn PromptSender>,
        registries: Arc<RegistrySet>,
        events: Arc<dyn EventSink>,
        config: DirectConfig,
    ) -> Self {
        Self {
            store,
            sender,
            registries,
            events,
            config,
            late_replies: DashMap::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DirectConfig {
        &self.config
    }

    /// Queue a direct message as `pending`.
    pub async fn enqueue_direct(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> RelayResult<DirectQueueEntry> {
        if from == to {
            return Err(RelayError::rejected("cannot direct message yourself"));
        }
        if text.trim().is_empty() {
            return Err(RelayError::rejected("prompt is empty"));
        }
        if self.store.get_agent(to).await?.is_none() {
            return Err(RelayError::not_found(format!("agent {to}")));
        }
        let sender_project = self
            .store
            .get_agent(from)
            .await?
            .map(|a| a.project_name)
            .filter(|p| !p.is_empty());

        let wrapped = prompt::wrap_direct(from, sender_project.as_deref(), text);
        let entry = DirectQueueEntry::new(from, to, text, wrapped);
        self.store.insert_direct(&entry).await?;
        info!("direct message {} queued: @{} -> @{}", entry.id, from, to);
        Ok(entry)
    }

    /// Queue and deliver a direct message, waiting for the reply.
    ///
    /// `timeout` bounds the backend call (and the whole wait in smart-pull mode).
    pub async fn direct_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
        mode: DirectMode,
        timeout: Option<Duration>,
    ) -> RelayResult<DirectOutcome> {
        let entry = self.enqueue_direct(from, to, text).await?;
        let backend_timeout = timeout.unwrap_or(self.config.fallback_timeout);

        if mode != DirectMode::Subprocess {
            let wait = match mode {
                DirectMode::Auto => self.config.smart_pull_wait,
                _ => backend_timeout,
            };
            if let Some(replied) = self.wait_for_reply(&entry.id, wait).await? {
                info!("direct message {} answered via smart pull", entry.id);
                return Ok(Self::answered(&replied));
            }
            if mode == DirectMode::SmartPull {
                return Ok(DirectOutcome::new(&entry, Resolution::Pending).with_error(format!(
                    "@{to} did not reply within {wait:?}; the message stays queued"
                )));
            }
            info!(
                "direct message {} not answered within {:?}, trying fallback",
                entry.id, wait
            );
        }

        self.fallback(&entry, backend_timeout).await
    }

    fn answered(entry: &DirectQueueEntry) -> DirectOutcome {
        DirectOutcome::new(entry, Resolution::SmartPull)
            .with_output(entry.response.clone().unwrap_or_default())
    }

    /// Poll until the entry is answered, settles otherwise, or `wait` elapses.
    async fn wait_for_reply(
        &self,
        id: &str,
        wait: Duration,
    ) -> RelayResult<Option<DirectQueueEntry>> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
            match self.store.get_direct(id).await? {
                Some(entry) if entry.status == DirectStatus::Responded => return Ok(Some(entry)),
                Some(entry) if entry.status.is_terminal() => return Ok(None),
                None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn fallback(
        &self,
        entry: &DirectQueueEntry,
        timeout: Duration,
    ) -> RelayResult<DirectOutcome> {
        let Some(mut target) = self.store.get_agent(&entry.to_agent).await? else {
            return Err(RelayError::not_found(format!("agent {}", entry.to_agent)));
        };
        if !target.has_fallback_capability() {
            info!(
                "no backend for @{}; direct message {} stays pending",
                target.name, entry.id
            );
            return Ok(DirectOutcome::new(entry, Resolution::Pending).with_error(format!(
                "no backend available for @{}; they will see the message on their next request",
                target.name
            )));
        }

        if target.cli_session_id.is_none() && !target.project_path.is_empty() {
            if let Some(found) = self
                .registries
                .latest_session(target.agent_type, &target.project_path)
                .await
            {
                self.store
                    .set_cli_session(&target.name, Some(&found.session_id))
                    .await?;
                target.cli_session_id = Some(found.session_id);
            }
        }

        // The slot must exist before the status flips.
        let slot = LateReplySlot::open(&self.late_replies, &entry.id);
        let moved = self
            .store
            .transition_direct(&entry.id, DirectStatus::Fallback, None)
            .await?;
        if !moved {
            let reply = slot.close();
            return self.settled(entry, reply).await;
        }

        let result = self
            .sender
            .dispatch(&target, &entry.wrapped_prompt, timeout)
            .await;

        if let Some(reply) = slot.close() {
            info!(
                "direct message {} answered via smart pull during fallback; discarding backend output",
                entry.id
            );
            return Ok(DirectOutcome::new(entry, Resolution::SmartPull).with_output(reply));
        }

        match result {
            Ok(outcome) => {
                self.resolved(entry, DirectStatus::Fallback, Some(outcome.output.clone()));
                let mut done =
                    DirectOutcome::new(entry, Resolution::Fallback).with_output(outcome.output);
                done.backend = Some(outcome.backend);
                Ok(done)
            }
            Err(BackendError::Timeout(after)) => {
                warn!("fallback for direct message {} timed out", entry.id);
                Ok(DirectOutcome::new(entry, Resolution::TimedOut)
                    .with_error(format!("@{} did not answer within {after:?}", target.name)))
            }
            Err(e) => {
                warn!("fallback for direct message {} failed: {}", entry.id, e);
                Ok(DirectOutcome::new(entry, Resolution::Failed).with_error(e.to_string()))
            }
        }
    }

    /// Outcome for an entry that left `pending`/`delivered` under us.
    async fn settled(
        &self,
        entry: &DirectQueueEntry,
        late_reply: Option<String>,
    ) -> RelayResult<DirectOutcome> {
        if let Some(reply) = late_reply {
            return Ok(DirectOutcome::new(entry, Resolution::SmartPull).with_output(reply));
        }
        let current = self
            .store
            .get_direct(&entry.id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("direct message {}", entry.id)))?;
        Ok(match current.status {
            DirectStatus::Responded => Self::answered(&current),
            DirectStatus::Expired => DirectOutcome::new(entry, Resolution::Expired),
            DirectStatus::Fallback => DirectOutcome::new(entry, Resolution::Failed)
                .with_error("already handled by another fallback"),
            DirectStatus::Pending | DirectStatus::Delivered => {
                DirectOutcome::new(entry, Resolution::Pending)
            }
        })
    }

    fn record_late_reply(&self, id: &str, response: &str) -> bool {
        match self.late_replies.get_mut(id) {
            Some(mut slot) => {
                if slot.is_none() {
                    *slot = Some(response.to_string());
                }
                true
            }
            None => false,
        }
    }

    fn resolved(&self, entry: &DirectQueueEntry, status: DirectStatus, response: Option<String>) {
        self.events.notify(HubEvent::DirectMessageResolved {
            entry_id: entry.id.clone(),
            from_agent: entry.from_agent.clone(),
            to_agent: entry.to_agent.clone(),
            status,
            response,
        });
    }

    /// Record the recipient's answer.
    pub async fn respond_direct(
        &self,
        entry_id: &str,
        responder: &str,
        response: &str,
    ) -> RelayResult<DirectQueueEntry> {
        let Some(mut entry) = self.store.get_direct(entry_id).await? else {
            return Err(RelayError::not_found(format!(
                "direct message {entry_id} (it may have expired)"
            )));
        };
        if entry.to_agent != responder {
            return Err(RelayError::rejected(format!(
                "direct message {entry_id} is addressed to @{}, not @{responder}",
                entry.to_agent
            )));
        }
        if let Err(e) = self.store.touch(responder).await {
            debug!("could not bump last-seen for {}: {}", responder, e);
        }

        let accepted = if entry.status.is_terminal() {
            false
        } else {
            self.store
                .transition_direct(entry_id, DirectStatus::Responded, Some(response))
                .await?
        };

        if accepted {
            entry.transition(DirectStatus::Responded, Some(response));
        } else if self.record_late_reply(entry_id, response) {
            entry.response = Some(response.to_string());
            entry.responded_at = Some(Utc::now());
        } else {
            let status = self
                .store
                .get_direct(entry_id)
                .await?
                .map_or(entry.status, |e| e.status);
            return Err(RelayError::conflict(match status {
                DirectStatus::Responded => "already responded to this message".to_string(),
                DirectStatus::Expired => "this message has expired".to_string(),
                DirectStatus::Fallback => "already handled via backend fallback".to_string(),
                other => format!("message is {other}"),
            }));
        }

        info!(
            "direct message {} answered by @{} ({} chars)",
            entry_id,
            responder,
            response.len()
        );
        self.resolved(&entry, DirectStatus::Responded, Some(response.to_string()));
        Ok(entry)
    }

    /// Hand the recipient its pending messages, marking them delivered.
    pub async fn take_pending(&self, agent: &str) -> RelayResult<Vec<DirectQueueEntry>> {
        self.sweep().await?;
        let entries = self.store.take_pending_direct(agent).await?;
        if !entries.is_empty() {
            info!("smart pull: delivering {} direct message(s) to {}", entries.len(), agent);
        }
        Ok(entries)
    }

    /// [`take_pending`](Self::take_pending), rendered as a block to append to
    /// the agent's next response. `None` when nothing is waiting.
    pub async fn pickup(&self, agent: &str) -> RelayResult<Option<String>> {
        let entries = self.take_pending(agent).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(prompt::render_pickup(agent, &entries)))
    }

    pub async fn queue_status(&self, filter: &QueueFilter) -> RelayResult<Vec<DirectQueueEntry>> {
        Ok(self.store.list_direct(filter).await?)
    }

    /// Expire unanswered entries older than the configured age.
    pub async fn sweep(&self) -> RelayResult<u64> {
        let max_age =
            ChronoDuration::from_std(self.config.max_age).unwrap_or(ChronoDuration::minutes(5));
        let expired = self.store.expire_direct_before(Utc::now() - max_age).await?;
        if expired > 0 {
            info!("expired {} stale direct message(s)", expired);
        }
        Ok(expired)
    }

    /// Start the periodic expiry sweep. A second call is a no-op.
    pub async fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let queue = Arc::clone(self);
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.sweep().await {
                            warn!("direct queue sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("direct queue sweeper stopped");
        });
        *slot = Some(SweepLoop { cancel, handle });
    }

    pub async fn stop_sweeper(&self) {
        let Some(task) = self.sweeper.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("direct queue sweeper ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, AgentType};
    use crate::backend::{BackendResult, PromptOutcome};
    use crate::discovery::{RegistryEntry, SessionRegistry};
    use crate::events::{BroadcastSink, drain};
    use crate::store::{AgentStore, DirectQueueStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    enum Behavior {
        Reply(&'static str),
        Timeout,
    }

    struct FakeSender {
        calls: StdMutex<Vec<(AgentIdentity, String)>>,
        delay: Duration,
        behavior: Behavior,
    }

    impl FakeSender {
        fn new(behavior: Behavior, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                delay,
                behavior,
            })
        }

        fn calls(&self) -> Vec<(AgentIdentity, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PromptSender for FakeSender {
        async fn dispatch(
            &self,
            agent: &AgentIdentity,
            prompt: &str,
            timeout: Duration,
        ) -> BackendResult<PromptOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push((agent.clone(), prompt.to_string()));
            tokio::time::sleep(self.delay).await;
            match self.behavior {
                Behavior::Reply(text) => Ok(PromptOutcome {
                    output: text.to_string(),
                    session_id: None,
                    backend: BackendKind::Subprocess,
                    duration: self.delay,
                }),
                Behavior::Timeout => Err(BackendError::Timeout(timeout)),
            }
        }
    }

    struct OneSession(String);

    #[async_trait]
    impl SessionRegistry for OneSession {
        fn cli(&self) -> AgentType {
            AgentType::Claude
        }

        async fn latest_for(&self, project_path: &str) -> Option<RegistryEntry> {
            Some(RegistryEntry {
                session_id: self.0.clone(),
                directory: project_path.to_string(),
                updated_at: Utc::now(),
            })
        }
    }

    struct Fixture {
        queue: Arc<DirectQueue>,
        store: Arc<MemoryStore>,
        sender: Arc<FakeSender>,
        sink: Arc<BroadcastSink>,
        _dir: TempDir,
    }

    fn fast_config() -> DirectConfig {
        DirectConfig {
            poll_interval: Duration::from_millis(10),
            smart_pull_wait: Duration::from_millis(500),
            fallback_timeout: Duration::from_secs(2),
            max_age: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    async fn fixture(sender: Arc<FakeSender>, registries: RegistrySet) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let project = dir.path().to_string_lossy().into_owned();
        store
            .upsert_agent(&AgentIdentity::new("yara", AgentType::Claude, project.clone()))
            .await
            .unwrap();
        store
            .upsert_agent(&AgentIdentity::new("nibex", AgentType::Claude, project))
            .await
            .unwrap();
        // Registered but with nothing to run a fallback with.
        store
            .upsert_agent(&AgentIdentity::new("quill", AgentType::Claude, ""))
            .await
            .unwrap();
        let sink = Arc::new(BroadcastSink::default());
        let queue = Arc::new(DirectQueue::new(
            store.clone(),
            sender.clone(),
            Arc::new(registries),
            sink.clone(),
            fast_config(),
        ));
        Fixture {
            queue,
            store,
            sender,
            sink,
            _dir: dir,
        }
    }

    async fn default_fixture() -> Fixture {
        fixture(
            FakeSender::new(Behavior::Reply("from backend"), Duration::ZERO),
            RegistrySet::default(),
        )
        .await
    }

    async fn only_entry(store: &MemoryStore, to: &str) -> DirectQueueEntry {
        let filter = QueueFilter {
            to_agent: Some(to.to_string()),
            ..Default::default()
        };
        let mut entries = store.list_direct(&filter).await.unwrap();
        assert_eq!(entries.len(), 1);
        entries.remove(0)
    }

    /// Wait until `to` has an entry in `status`.
    async fn wait_for_status(store: &MemoryStore, to: &str, status: DirectStatus) -> DirectQueueEntry {
        for _ in 0..1000 {
            let filter = QueueFilter {
                to_agent: Some(to.to_string()),
                status: Some(status),
                limit: None,
            };
            if let Some(entry) = store.list_direct(&filter).await.unwrap().pop() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no entry for {to} reached {status}");
    }

    #[tokio::test]
    async fn test_direct_message_to_self_is_rejected() {
        let f = default_fixture().await;
        let err = f.queue.enqueue_direct("yara", "yara", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::Rejected(_)));
        let err = f.queue.enqueue_direct("yara", "nobody", "hi").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_enqueue_wraps_prompt_with_sender() {
        let f = default_fixture().await;
        let entry = f.queue.enqueue_direct("yara", "nibex", "status?").await.unwrap();
        assert_eq!(entry.status, DirectStatus::Pending);
        assert_eq!(entry.prompt, "status?");
        assert!(entry.wrapped_prompt.contains("Direct message from yara"));
        assert!(entry.wrapped_prompt.contains("status?"));
    }

    #[tokio::test]
    async fn test_smart_pull_reply_resolves_message() {
        let f = default_fixture().await;
        let queue = f.queue.clone();
        let task = tokio::spawn(async move {
            queue
                .direct_message("yara", "nibex", "ping", DirectMode::Auto, None)
                .await
        });

        let entry = wait_for_status(&f.store, "nibex", DirectStatus::Pending).await;
        let picked = f.queue.take_pending("nibex").await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].status, DirectStatus::Delivered);
        f.queue.respond_direct(&entry.id, "nibex", "pong").await.unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.resolution, Resolution::SmartPull);
        assert_eq!(outcome.output.as_deref(), Some("pong"));
        assert!(f.sender.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unanswered_message_falls_back_once() {
        let f = default_fixture().await;
        let mut rx = f.sink.subscribe();
        let outcome = f
            .queue
            .direct_message("yara", "nibex", "ping", DirectMode::Auto, None)
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Fallback);
        assert_eq!(outcome.output.as_deref(), Some("from backend"));
        assert_eq!(outcome.backend, Some(BackendKind::Subprocess));

        let calls = f.sender.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.name, "nibex");
        assert!(calls[0].1.contains("ping"));
        assert_eq!(only_entry(&f.store, "nibex").await.status, DirectStatus::Fallback);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            HubEvent::DirectMessageResolved { status: DirectStatus::Fallback, .. }
        )));
    }

    #[tokio::test]
    async fn test_no_backend_leaves_entry_pending() {
        let f = default_fixture().await;
        let outcome = f
            .queue
            .direct_message("yara", "quill", "ping", DirectMode::Auto, None)
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Pending);
        assert!(outcome.error.is_some());
        assert!(f.sender.calls().is_empty());
        assert_eq!(only_entry(&f.store, "quill").await.status, DirectStatus::Pending);
    }

    #[tokio::test]
    async fn test_reply_during_fallback_wins() {
        let f = fixture(
            FakeSender::new(Behavior::Reply("from backend"), Duration::from_millis(300)),
            RegistrySet::default(),
        )
        .await;
        let mut rx = f.sink.subscribe();
        let queue = f.queue.clone();
        let task = tokio::spawn(async move {
            queue
                .direct_message("yara", "nibex", "ping", DirectMode::Auto, None)
                .await
        });

        let entry = wait_for_status(&f.store, "nibex", DirectStatus::Fallback).await;
        let answered = f.queue.respond_direct(&entry.id, "nibex", "late pong").await.unwrap();
        assert_eq!(answered.response.as_deref(), Some("late pong"));

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.resolution, Resolution::SmartPull);
        assert_eq!(outcome.output.as_deref(), Some("late pong"));
        assert_eq!(f.sender.calls().len(), 1);

        let resolved: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                HubEvent::DirectMessageResolved { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(resolved, vec![DirectStatus::Responded]);
    }

    #[tokio::test]
    async fn test_abandoned_fallback_stops_accepting_replies() {
        let f = fixture(
            FakeSender::new(Behavior::Reply("from backend"), Duration::from_secs(30)),
            RegistrySet::default(),
        )
        .await;
        let queue = f.queue.clone();
        let task = tokio::spawn(async move {
            queue
                .direct_message("yara", "nibex", "ping", DirectMode::Subprocess, None)
                .await
        });

        let entry = wait_for_status(&f.store, "nibex", DirectStatus::Fallback).await;
        while f.sender.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(f.queue.late_replies.is_empty());
        let err = f.queue.respond_direct(&entry.id, "nibex", "pong").await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_respond_validation() {
        let f = default_fixture().await;
        let err = f.queue.respond_direct("missing", "nibex", "x").await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));

        let entry = f.queue.enqueue_direct("yara", "nibex", "ping").await.unwrap();
        let err = f.queue.respond_direct(&entry.id, "quill", "x").await.unwrap_err();
        assert!(matches!(err, RelayError::Rejected(_)));

        f.queue.respond_direct(&entry.id, "nibex", "pong").await.unwrap();
        let err = f.queue.respond_direct(&entry.id, "nibex", "again").await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
        let stored = f.store.get_direct(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.response.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_respond_after_fallback_finished_is_conflict() {
        let f = default_fixture().await;
        f.queue
            .direct_message("yara", "nibex", "ping", DirectMode::Subprocess, None)
            .await
            .unwrap();
        let entry = only_entry(&f.store, "nibex").await;
        let err = f.queue.respond_direct(&entry.id, "nibex", "x").await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_smart_pull_mode_never_falls_back() {
        let f = default_fixture().await;
        let outcome = f
            .queue
            .direct_message(
                "yara",
                "nibex",
                "ping",
                DirectMode::SmartPull,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Pending);
        assert!(f.sender.calls().is_empty());
        assert_eq!(only_entry(&f.store, "nibex").await.status, DirectStatus::Pending);
    }

    #[tokio::test]
    async fn test_subprocess_mode_skips_smart_pull() {
        let f = fixture(
            FakeSender::new(Behavior::Reply("fast"), Duration::ZERO),
            RegistrySet::default(),
        )
        .await;
        let started = std::time::Instant::now();
        let outcome = f
            .queue
            .direct_message("yara", "nibex", "ping", DirectMode::Subprocess, None)
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Fallback);
        assert!(started.elapsed() < f.queue.config().smart_pull_wait);
    }

    #[tokio::test]
    async fn test_fallback_timeout_is_reported() {
        let f = fixture(
            FakeSender::new(Behavior::Timeout, Duration::ZERO),
            RegistrySet::default(),
        )
        .await;
        let outcome = f
            .queue
            .direct_message("yara", "nibex", "ping", DirectMode::Subprocess, None)
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::TimedOut);
        assert!(outcome.error.unwrap().contains("nibex"));
    }

    #[tokio::test]
    async fn test_fallback_discovers_missing_cli_session() {
        let registries = RegistrySet::new(vec![Arc::new(OneSession("claude-sid".into()))]);
        let f = fixture(
            FakeSender::new(Behavior::Reply("ok"), Duration::ZERO),
            registries,
        )
        .await;
        f.queue
            .direct_message("yara", "nibex", "ping", DirectMode::Subprocess, None)
            .await
            .unwrap();
        let calls = f.sender.calls();
        assert_eq!(calls[0].0.cli_session_id.as_deref(), Some("claude-sid"));
        let stored = f.store.get_agent("nibex").await.unwrap().unwrap();
        assert_eq!(stored.cli_session_id.as_deref(), Some("claude-sid"));
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_entries() {
        let f = default_fixture().await;
        let mut old = DirectQueueEntry::new("yara", "nibex", "old", "old");
        old.created_at = Utc::now() - ChronoDuration::minutes(10);
        f.store.insert_direct(&old).await.unwrap();
        let fresh = f.queue.enqueue_direct("yara", "nibex", "new").await.unwrap();

        let picked = f.queue.take_pending("nibex").await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, fresh.id);
        let stored = f.store.get_direct(&old.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DirectStatus::Expired);
        assert_eq!(f.queue.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pickup_renders_reply_instructions() {
        let f = default_fixture().await;
        assert!(f.queue.pickup("nibex").await.unwrap().is_none());
        let entry = f.queue.enqueue_direct("yara", "nibex", "ping").await.unwrap();
        let block = f.queue.pickup("nibex").await.unwrap().unwrap();
        assert!(block.contains(&entry.id));
        assert!(block.contains("@yara"));
        assert!(f.queue.pickup("nibex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweeper_lifecycle() {
        let f = default_fixture().await;
        f.queue.start_sweeper().await;
        f.queue.start_sweeper().await;
        f.queue.stop_sweeper().await;
        assert!(f.queue.sweeper.lock().await.is_none());
    }
}
