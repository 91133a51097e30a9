//! Route a prompt to the right backend for an agent.

use async_trait::async_trait;
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::subprocess::SubprocessRunner;
use super::supervisor::BackendSupervisor;
use super::{BackendError, BackendResult, PromptOutcome};
use crate::agent::{AgentIdentity, AgentType};
use crate::store::Store;

/// Synchronous prompt delivery to one agent.
#[async_trait]
pub trait PromptSender: Send + Sync {
    async fn dispatch(
        &self,
        agent: &AgentIdentity,
        prompt: &str,
        timeout: Duration,
    ) -> BackendResult<PromptOutcome>;
}

/// Picks the persistent server for OpenCode agents and a one-shot
/// subprocess otherwise, falling back to the subprocess whenever the server
/// path fails for a reason other than a timeout.
pub struct Dispatcher {
    supervisor: Option<Arc<BackendSupervisor>>,
    runner: SubprocessRunner,
    store: Arc<dyn Store>,
}

impl Dispatcher {
    pub fn new(
        supervisor: Option<Arc<BackendSupervisor>>,
        runner: SubprocessRunner,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            supervisor,
            runner,
            store,
        }
    }

    pub fn supervisor(&self) -> Option<&Arc<BackendSupervisor>> {
        self.supervisor.as_ref()
    }

    pub fn runner(&self) -> &SubprocessRunner {
        &self.runner
    }

    async fn via_subprocess(
        &self,
        agent: &AgentIdentity,
        prompt: &str,
        timeout: Duration,
    ) -> BackendResult<PromptOutcome> {
        let working_dir = project_dir(agent);
        self.runner
            .run(
                agent.agent_type,
                prompt,
                agent.cli_session_id.as_deref(),
                working_dir,
                timeout,
            )
            .await
    }

    /// Server path. `Ok(None)` means the server is unusable and the caller
    /// should fall back.
    async fn via_server(
        &self,
        supervisor: &Arc<BackendSupervisor>,
        agent: &AgentIdentity,
        prompt: &str,
        timeout: Duration,
    ) -> BackendResult<Option<PromptOutcome>> {
        if let Err(e) = supervisor.start_in(project_dir(agent)).await {
            warn!("opencode server unavailable ({}), using subprocess for {}", e, agent.name);
            return Ok(None);
        }

        let title = format!("Tether: {}", agent.name);
        let session_id = match &agent.backend_session_id {
            Some(id) => id.clone(),
            None => match supervisor.create_session(&title).await {
                Ok(id) => {
                    info!("created backend session {} for {}", id, agent.name);
                    if let Err(e) = self.store.set_backend_session(&agent.name, Some(&id)).await {
                        warn!("failed to persist backend session for {}: {}", agent.name, e);
                    }
                    id
                }
                Err(e) => {
                    warn!("cannot create backend session for {}: {}", agent.name, e);
                    return Ok(None);
                }
            },
        };

        match supervisor.send(Some(&session_id), &title, prompt, timeout).await {
            Ok(outcome) => {
                if let Some(new_id) = outcome.session_id.as_deref() {
                    if new_id != session_id {
                        info!("backend session for {} replaced: {}", agent.name, new_id);
                        if let Err(e) = self.store.set_backend_session(&agent.name, Some(new_id)).await {
                            warn!("failed to persist backend session for {}: {}", agent.name, e);
                        }
                    }
                }
                Ok(Some(outcome))
            }
            Err(e @ BackendError::Timeout(_)) => Err(e),
            Err(e) => {
                warn!("server delivery to {} failed ({}), using subprocess", agent.name, e);
                Ok(None)
            }
        }
    }
}

fn project_dir(agent: &AgentIdentity) -> Option<&Path> {
    Some(agent.project_path.as_str())
        .filter(|p| !p.is_empty())
        .map(Path::new)
}

#[async_trait]
impl PromptSender for Dispatcher {
    async fn dispatch(
        &self,
        agent: &AgentIdentity,
        prompt: &str,
        timeout: Duration,
    ) -> BackendResult<PromptOutcome> {
        if agent.agent_type == AgentType::Opencode {
            if let Some(supervisor) = &self.supervisor {
                if let Some(outcome) = self.via_server(supervisor, agent, prompt, timeout).await? {
                    return Ok(outcome);
                }
            }
        }
        self.via_subprocess(agent, prompt, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::{ServerLauncher, ServerProcess};
    use crate::backend::supervisor::SupervisorConfig;
    use crate::backend::BackendKind;
    use crate::events::BroadcastSink;
    use crate::opencode::test_server::{self, FakeState, Shared};
    use crate::store::{AgentStore, MemoryStore};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A port holder that is already healthy, so the supervisor adopts it.
    struct AdoptOnly;

    #[async_trait]
    impl ServerLauncher for AdoptOnly {
        fn port_in_use(&self, _port: u16) -> bool {
            true
        }

        async fn spawn(
            &self,
            _port: u16,
            _working_dir: Option<&Path>,
        ) -> BackendResult<Box<dyn ServerProcess>> {
            Err(BackendError::StartFailed("spawning disabled".into()))
        }
    }

    /// Free port; records where each spawn was asked to run, then fails it.
    #[derive(Default)]
    struct RecordingLauncher {
        dirs: std::sync::Mutex<Vec<Option<PathBuf>>>,
    }

    #[async_trait]
    impl ServerLauncher for RecordingLauncher {
        fn port_in_use(&self, _port: u16) -> bool {
            false
        }

        async fn spawn(
            &self,
            _port: u16,
            working_dir: Option<&Path>,
        ) -> BackendResult<Box<dyn ServerProcess>> {
            self.dirs.lock().unwrap().push(working_dir.map(Path::to_path_buf));
            Err(BackendError::StartFailed("spawning disabled".into()))
        }
    }

    async fn supervisor(state: Shared) -> Arc<BackendSupervisor> {
        let url = test_server::spawn(state).await;
        let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
        Arc::new(BackendSupervisor::new(
            SupervisorConfig {
                port,
                watchdog_interval: Duration::from_secs(3600),
                ..Default::default()
            },
            Arc::new(AdoptOnly),
            reqwest::Client::new(),
            Arc::new(BroadcastSink::default()),
        ))
    }

    /// Runner whose opencode binary is `sh`, running `./run` in the project dir.
    fn sh_runner(dir: &TempDir) -> SubprocessRunner {
        std::fs::write(dir.path().join("run"), "echo \"subprocess: $@\"\n").unwrap();
        SubprocessRunner::new(HashMap::from([(AgentType::Opencode, PathBuf::from("sh"))]))
    }

    async fn stored_agent(store: &MemoryStore, dir: &TempDir) -> AgentIdentity {
        let agent = AgentIdentity::new(
            "nibex",
            AgentType::Opencode,
            dir.path().to_string_lossy().into_owned(),
        );
        store.upsert_agent(&agent).await.unwrap()
    }

    #[tokio::test]
    async fn test_opencode_agent_uses_server_and_persists_session() {
        let state: Shared = Arc::new(std::sync::Mutex::new(FakeState {
            healthy: true,
            ..Default::default()
        }));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let agent = stored_agent(&store, &dir).await;
        let sup = supervisor(state.clone()).await;
        let dispatcher = Dispatcher::new(Some(sup.clone()), sh_runner(&dir), store.clone());

        let outcome = dispatcher
            .dispatch(&agent, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.backend, BackendKind::Server);
        assert_eq!(outcome.output, "echo: hello");
        let stored = store.get_agent("nibex").await.unwrap().unwrap();
        assert_eq!(stored.backend_session_id.as_deref(), Some("ses_new1"));
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_replaced_session_is_persisted() {
        let state: Shared = Arc::new(std::sync::Mutex::new(FakeState {
            healthy: true,
            missing: vec!["ses_old".into()],
            ..Default::default()
        }));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut agent = stored_agent(&store, &dir).await;
        store.set_backend_session("nibex", Some("ses_old")).await.unwrap();
        agent.backend_session_id = Some("ses_old".into());
        let sup = supervisor(state).await;
        let dispatcher = Dispatcher::new(Some(sup.clone()), sh_runner(&dir), store.clone());

        dispatcher
            .dispatch(&agent, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        let stored = store.get_agent("nibex").await.unwrap().unwrap();
        assert_eq!(stored.backend_session_id.as_deref(), Some("ses_new1"));
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_unusable_server_falls_back_to_subprocess() {
        // Port holder answers unhealthy, so start fails with a conflict.
        let state: Shared = Arc::new(std::sync::Mutex::new(FakeState::default()));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let agent = stored_agent(&store, &dir).await;
        let sup = supervisor(state).await;
        let dispatcher = Dispatcher::new(Some(sup), sh_runner(&dir), store);

        let outcome = dispatcher
            .dispatch(&agent, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.backend, BackendKind::Subprocess);
        assert_eq!(outcome.output, "subprocess: --continue hello");
    }

    #[tokio::test]
    async fn test_server_timeout_is_not_retried() {
        let state: Shared = Arc::new(std::sync::Mutex::new(FakeState {
            healthy: true,
            message_delay_ms: 1000,
            ..Default::default()
        }));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let agent = stored_agent(&store, &dir).await;
        let sup = supervisor(state).await;
        let dispatcher = Dispatcher::new(Some(sup.clone()), sh_runner(&dir), store);

        let err = dispatcher
            .dispatch(&agent, "hello", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_cold_start_runs_in_agent_project() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let agent = stored_agent(&store, &dir).await;
        let launcher = Arc::new(RecordingLauncher::default());
        let sup = Arc::new(BackendSupervisor::new(
            SupervisorConfig {
                port: 1,
                ..Default::default()
            },
            launcher.clone(),
            reqwest::Client::new(),
            Arc::new(BroadcastSink::default()),
        ));
        let dispatcher = Dispatcher::new(Some(sup), sh_runner(&dir), store);

        let outcome = dispatcher
            .dispatch(&agent, "hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.backend, BackendKind::Subprocess);
        assert_eq!(
            *launcher.dirs.lock().unwrap(),
            vec![Some(dir.path().to_path_buf())]
        );
    }

    #[tokio::test]
    async fn test_without_supervisor_uses_subprocess() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let agent = stored_agent(&store, &dir).await;
        let dispatcher = Dispatcher::new(None, sh_runner(&dir), store);
        let outcome = dispatcher
            .dispatch(&agent, "hi", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.backend, BackendKind::Subprocess);
    }
}
