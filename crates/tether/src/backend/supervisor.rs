//! Lifecycle of the persistent OpenCode server.
//!
//! State machine: `stopped -> starting -> running -> {error, stopped}`. At
//! most one start runs at a time; concurrent callers wait for it and observe
//! its result instead of spawning a second process. A watchdog health-checks
//! the server and restarts it once per failed check.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::{ServerLauncher, ServerProcess};
use super::{BackendError, BackendKind, BackendResult, BackendStatus, PromptOutcome};
use crate::agent::AgentType;
use crate::events::{EventSink, HubEvent};
use crate::opencode::{OpenCodeClient, OpenCodeError};

/// Tunables for one supervised server.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port: u16,
    /// Working directory for a spawned server. When unset the server starts in
    /// the project of the agent that first needed it.
    pub working_dir: Option<PathBuf>,
    pub health_timeout: Duration,
    pub health_poll: Duration,
    pub start_timeout: Duration,
    pub session_timeout: Duration,
    pub abort_timeout: Duration,
    pub dispose_timeout: Duration,
    pub stop_grace: Duration,
    pub watchdog_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port: 4096,
            working_dir: None,
            health_timeout: Duration::from_secs(5),
            health_poll: Duration::from_secs(1),
            start_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(30),
            abort_timeout: Duration::from_secs(10),
            dispose_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub cli: AgentType,
    pub port: u16,
    pub base_url: String,
    pub status: BackendStatus,
    pub pid: Option<u32>,
    pub owned: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u64,
    pub watchdog_running: bool,
    pub watchdog_interval_secs: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What one watchdog pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Nothing is supposed to be running.
    Idle,
    Healthy,
    /// A start was already in flight; the check was skipped.
    Skipped,
    Restarted,
    RestartFailed,
}

#[derive(Default)]
struct Instance {
    process: Option<Box<dyn ServerProcess>>,
    owned: bool,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct WatchdogLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervisor for the OpenCode server on one port.
pub struct BackendSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ServerLauncher>,
    client: OpenCodeClient,
    events: Arc<dyn EventSink>,
    instance: Mutex<Instance>,
    /// Held for the whole of a start; the watchdog only `try_lock`s it.
    start_lock: Mutex<()>,
    status_tx: watch::Sender<BackendStatus>,
    restart_count: AtomicU64,
    last_health_check: std::sync::RwLock<Option<DateTime<Utc>>>,
    /// Project dir of the last cold start, reused by watchdog restarts.
    project_dir: std::sync::RwLock<Option<PathBuf>>,
    watchdog: Mutex<Option<WatchdogLoop>>,
}

impl BackendSupervisor {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ServerLauncher>,
        http: reqwest::Client,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let client = OpenCodeClient::with_client(http, format!("http://127.0.0.1:{}", config.port));
        let (status_tx, _) = watch::channel(BackendStatus::Stopped);
        Self {
            config,
            launcher,
            client,
            events,
            instance: Mutex::new(Instance::default()),
            start_lock: Mutex::new(()),
            status_tx,
            restart_count: AtomicU64::new(0),
            last_health_check: std::sync::RwLock::new(None),
            project_dir: std::sync::RwLock::new(None),
            watchdog: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    pub fn client(&self) -> &OpenCodeClient {
        &self.client
    }

    pub fn status(&self) -> BackendStatus {
        *self.status_tx.borrow()
    }

    /// Receive every status transition.
    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.status_tx.subscribe()
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> BackendSnapshot {
        let instance = self.instance.lock().await;
        BackendSnapshot {
            cli: AgentType::Opencode,
            port: self.config.port,
            base_url: self.base_url().to_string(),
            status: self.status(),
            pid: instance.process.as_ref().and_then(|p| p.pid()),
            owned: instance.owned,
            started_at: instance.started_at,
            restart_count: self.restart_count(),
            watchdog_running: self.watchdog.lock().await.is_some(),
            watchdog_interval_secs: self.config.watchdog_interval.as_secs(),
            last_health_check: self.last_health_check.read().map(|t| *t).unwrap_or(None),
            last_error: instance.last_error.clone(),
        }
    }

    fn set_status(&self, status: BackendStatus, error: Option<String>) {
        let previous = self.status_tx.send_replace(status);
        if previous == status && error.is_none() {
            return;
        }
        debug!("opencode backend {} -> {}", previous, status);
        self.events.notify(HubEvent::BackendStatusChanged {
            cli: AgentType::Opencode,
            port: self.config.port,
            status,
            error,
        });
    }

    async fn fail(&self, err: BackendError) -> BackendError {
        let message = err.to_string();
        self.instance.lock().await.last_error = Some(message.clone());
        self.set_status(BackendStatus::Error, Some(message));
        err
    }

    /// `GET /global/health` reports healthy.
    pub async fn is_healthy(&self) -> bool {
        match self.client.health(self.config.health_timeout).await {
            Ok(info) => info.healthy,
            Err(e) => {
                debug!("health check on {} failed: {}", self.base_url(), e);
                false
            }
        }
    }

    /// Bring the server up, then start the watchdog.
    ///
    /// Returns immediately when already running. Callers that arrive while a
    /// start is in flight wait for it.
    pub async fn start(self: &Arc<Self>) -> BackendResult<()> {
        self.start_in(None).await
    }

    /// Like [`start`](Self::start), spawning in `project_dir` unless a working
    /// directory is configured.
    pub async fn start_in(self: &Arc<Self>, project_dir: Option<&Path>) -> BackendResult<()> {
        {
            let _guard = self.start_lock.lock().await;
            if self.status() == BackendStatus::Running {
                return Ok(());
            }
            if let (Some(dir), Ok(mut slot)) = (project_dir, self.project_dir.write()) {
                *slot = Some(dir.to_path_buf());
            }
            self.start_locked().await?;
        }
        self.start_watchdog().await;
        Ok(())
    }

    fn spawn_dir(&self) -> Option<PathBuf> {
        self.config
            .working_dir
            .clone()
            .or_else(|| self.project_dir.read().ok().and_then(|dir| dir.clone()))
    }

    /// Start with `start_lock` held by the caller.
    async fn start_locked(&self) -> BackendResult<()> {
        if let Some(outcome) = self.resume_owned().await {
            return outcome;
        }

        let port = self.config.port;
        self.set_status(BackendStatus::Starting, None);

        if self.launcher.port_in_use(port) {
            if self.is_healthy().await {
                info!("reusing healthy opencode server on port {}", port);
                let mut instance = self.instance.lock().await;
                *instance = Instance {
                    process: None,
                    owned: false,
                    started_at: Some(Utc::now()),
                    last_error: None,
                };
                drop(instance);
                self.set_status(BackendStatus::Running, None);
                return Ok(());
            }
            let err = BackendError::Conflict(format!(
                "port {port} is in use by something that is not a healthy opencode server"
            ));
            return Err(self.fail(err).await);
        }

        let working_dir = self.spawn_dir();
        let mut process = match self.launcher.spawn(port, working_dir.as_deref()).await
        {
            Ok(process) => process,
            Err(e) => return Err(self.fail(e).await),
        };

        let started = Instant::now();
        loop {
            if let Some(report) = process.exited().await {
                let err = BackendError::StartFailed(format!(
                    "process exited with code {:?}: {}",
                    report.code,
                    report.stderr_excerpt()
                ));
                return Err(self.fail(err).await);
            }
            if self.is_healthy().await {
                break;
            }
            if started.elapsed() >= self.config.start_timeout {
                process.terminate(self.config.stop_grace).await;
                let err = BackendError::StartFailed(format!(
                    "not healthy within {:?}",
                    self.config.start_timeout
                ));
                return Err(self.fail(err).await);
            }
            tokio::time::sleep(self.config.health_poll).await;
        }

        info!(
            "opencode server healthy on port {} after {:?} (pid {:?})",
            port,
            started.elapsed(),
            process.pid()
        );
        *self.instance.lock().await = Instance {
            process: Some(process),
            owned: true,
            started_at: Some(Utc::now()),
            last_error: None,
        };
        self.set_status(BackendStatus::Running, None);
        Ok(())
    }

    /// Recover our own still-running child after an error instead of
    /// adopting it as a foreign server on a bound port.
    ///
    /// `None` means there is nothing to recover and a fresh start is needed.
    async fn resume_owned(&self) -> Option<BackendResult<()>> {
        let exit = {
            let mut instance = self.instance.lock().await;
            if !instance.owned {
                return None;
            }
            let process = instance.process.as_mut()?;
            process.exited().await
        };

        if let Some(report) = exit {
            info!("owned opencode server exited (code {:?}), respawning", report.code);
        } else if self.is_healthy().await {
            info!(
                "owned opencode server on port {} is healthy again",
                self.config.port
            );
            self.instance.lock().await.last_error = None;
            self.set_status(BackendStatus::Running, None);
            return Some(Ok(()));
        } else {
            warn!("owned opencode server is unhealthy, replacing it");
        }
        self.shutdown_instance().await;
        None
    }

    /// Create a remote session.
    pub async fn create_session(&self, title: &str) -> BackendResult<String> {
        self.client
            .create_session(title, self.config.session_timeout)
            .await
            .map_err(|e| self.map_remote(e))
    }

    /// Send a prompt and wait for the reply.
    ///
    /// Creates a session when `session_id` is `None`. A session unknown to the
    /// server is replaced once and the prompt retried. On timeout the remote
    /// session is aborted before reporting.
    pub async fn send(
        &self,
        session_id: Option<&str>,
        title: &str,
        prompt: &str,
        timeout: Duration,
    ) -> BackendResult<PromptOutcome> {
        if self.status() != BackendStatus::Running {
            return Err(BackendError::NotRunning);
        }
        let started = Instant::now();
        let mut session = match session_id {
            Some(id) => id.to_string(),
            None => self.create_session(title).await?,
        };

        let reply = match self.client.send_message(&session, prompt, timeout).await {
            Err(OpenCodeError::SessionNotFound(stale)) => {
                warn!("remote session {} is gone, creating a replacement", stale);
                session = self.create_session(&format!("{title} (recreated)")).await?;
                self.client.send_message(&session, prompt, timeout).await
            }
            other => other,
        };

        match reply {
            Ok(reply) => Ok(PromptOutcome {
                output: reply.text(),
                session_id: Some(session),
                backend: BackendKind::Server,
                duration: started.elapsed(),
            }),
            Err(OpenCodeError::Timeout) => {
                warn!("prompt to session {} timed out after {:?}", session, timeout);
                if let Err(e) = self.client.abort(&session, self.config.abort_timeout).await {
                    debug!("abort of {} failed: {}", session, e);
                }
                Err(BackendError::Timeout(timeout))
            }
            Err(e) => Err(self.map_remote(e)),
        }
    }

    fn map_remote(&self, err: OpenCodeError) -> BackendError {
        match err {
            OpenCodeError::Timeout => BackendError::Timeout(self.config.session_timeout),
            e if e.is_unreachable() => {
                let message = e.to_string();
                self.set_status(BackendStatus::Error, Some(message.clone()));
                BackendError::Connect(message)
            }
            e => BackendError::Remote(e.to_string()),
        }
    }

    /// Stop the watchdog and the server.
    pub async fn stop(&self) {
        self.stop_watchdog().await;
        let _guard = self.start_lock.lock().await;
        self.shutdown_instance().await;
    }

    /// Dispose and terminate the current instance, if owned.
    async fn shutdown_instance(&self) {
        let instance = std::mem::take(&mut *self.instance.lock().await);
        if let Some(mut process) = instance.process {
            if instance.owned && self.status() == BackendStatus::Running {
                if let Err(e) = self.client.dispose(self.config.dispose_timeout).await {
                    debug!("dispose failed: {}", e);
                }
            }
            process.terminate(self.config.stop_grace).await;
        } else if !instance.owned && instance.started_at.is_some() {
            debug!("releasing adopted opencode server on port {}", self.config.port);
        }
        self.set_status(BackendStatus::Stopped, None);
    }

    /// One watchdog pass: health-check and restart on failure.
    pub async fn check_and_restart(&self) -> WatchdogOutcome {
        if matches!(
            self.status(),
            BackendStatus::Stopped | BackendStatus::Starting
        ) {
            return WatchdogOutcome::Idle;
        }

        let exited = {
            let mut instance = self.instance.lock().await;
            match instance.process.as_mut() {
                Some(process) => process.exited().await,
                None => None,
            }
        };
        let healthy = exited.is_none() && self.is_healthy().await;
        if let Ok(mut at) = self.last_health_check.write() {
            *at = Some(Utc::now());
        }
        if healthy {
            if self.status() != BackendStatus::Running {
                self.set_status(BackendStatus::Running, None);
            }
            return WatchdogOutcome::Healthy;
        }

        let Ok(_guard) = self.start_lock.try_lock() else {
            debug!("watchdog: start in flight, skipping restart");
            return WatchdogOutcome::Skipped;
        };
        match exited {
            Some(report) => warn!(
                "watchdog: opencode server exited (code {:?}), restarting",
                report.code
            ),
            None => warn!("watchdog: opencode server unhealthy, restarting"),
        }
        self.shutdown_instance().await;
        match self.start_locked().await {
            Ok(()) => {
                let total = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;
                info!("watchdog: opencode server restarted (total restarts: {})", total);
                WatchdogOutcome::Restarted
            }
            Err(e) => {
                error!("watchdog: failed to restart opencode server: {}", e);
                WatchdogOutcome::RestartFailed
            }
        }
    }

    async fn start_watchdog(self: &Arc<Self>) {
        let mut slot = self.watchdog.lock().await;
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let supervisor = Arc::clone(self);
        let period = self.config.watchdog_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        supervisor.check_and_restart().await;
                    }
                }
            }
            debug!("backend watchdog stopped");
        });
        info!("backend watchdog checking every {:?}", period);
        *slot = Some(WatchdogLoop { cancel, handle });
    }

    async fn stop_watchdog(&self) {
        let Some(task) = self.watchdog.lock().await.take() else {
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("backend watchdog ended abnormally: {}", e);
        }
    }
}
