//! Composition root: builds every service from [`AppConfig`] and owns their lifecycles.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentService, AgentType};
use crate::backend::{
    BackendSupervisor, Dispatcher, OpenCodeLauncher, ServerLauncher, SubprocessRunner,
};
use crate::db::Database;
use crate::discovery::{
    DiscoveryResolver, LsofLocator, PsProcessTable, RegistrySet, ServerLocator, StaticLocator,
};
use crate::events::BroadcastSink;
use crate::liveness::{GhostCache, LivenessOracle, PidProbe, SignalProbe};
use crate::queue::{DirectMode, DirectQueue};
use crate::router::InvocationRouter;
use crate::settings::AppConfig;
use crate::store::{MemoryStore, SqliteStore, Store};

/// The seams a hub is assembled from.
pub struct HubDeps {
    pub store: Arc<dyn Store>,
    pub resolver: Arc<DiscoveryResolver>,
    pub registries: Arc<RegistrySet>,
    pub probe: Arc<dyn PidProbe>,
    /// `None` disables the persistent OpenCode server.
    pub launcher: Option<Arc<dyn ServerLauncher>>,
    pub runner: SubprocessRunner,
}

impl HubDeps {
    /// Real process table, on-disk registries, `kill(0)` probe and CLI binaries.
    pub fn system(config: &AppConfig, store: Arc<dyn Store>) -> Result<Self> {
        let http = reqwest::Client::new();
        let home = dirs::home_dir().context("unable to determine home directory")?;
        let max_age = ChronoDuration::hours(config.discovery.registry_max_age_hours);
        let registries = RegistrySet::from_home(&home, max_age);

        let locator: Arc<dyn ServerLocator> = match &config.discovery.server_url {
            Some(url) => Arc::new(StaticLocator::new(Some(url.clone()))),
            None => Arc::new(LsofLocator::new(Duration::from_secs(
                config.discovery.process_timeout_secs,
            ))),
        };
        let processes = Arc::new(PsProcessTable::new(Duration::from_secs(
            config.discovery.process_timeout_secs,
        )));
        let resolver = DiscoveryResolver::standard(
            processes,
            registries.clone(),
            http,
            locator,
            config.discovery.max_pid_hops,
            Duration::from_secs(config.discovery.probe_timeout_secs),
        );

        let runner = SubprocessRunner::new(config.cli_paths()?);
        let launcher: Option<Arc<dyn ServerLauncher>> = if config.backend.opencode_server {
            let binary = runner
                .program_for(AgentType::Opencode)
                .context("resolving opencode binary")?;
            Some(Arc::new(OpenCodeLauncher::new(binary)))
        } else {
            None
        };

        Ok(Self {
            store,
            resolver: Arc::new(resolver),
            registries: Arc::new(registries),
            probe: Arc::new(SignalProbe),
            launcher,
            runner,
        })
    }
}

/// Every long-lived service of a running hub.
pub struct Hub {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub events: Arc<BroadcastSink>,
    pub oracle: Arc<LivenessOracle>,
    pub ghosts: Arc<GhostCache>,
    pub resolver: Arc<DiscoveryResolver>,
    pub agents: Arc<AgentService>,
    pub queue: Arc<DirectQueue>,
    pub router: Arc<InvocationRouter>,
    pub supervisor: Option<Arc<BackendSupervisor>>,
    pub runner: SubprocessRunner,
    pub direct_mode: DirectMode,
}

impl Hub {
    /// Open the configured store and assemble a hub from system dependencies.
    pub async fn open(config: AppConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn Store> = if config.database.ephemeral {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        } else {
            let path = config.database_path()?;
            info!("opening database at {}", path.display());
            let db = Database::new(&path).await?;
            Arc::new(SqliteStore::new(&db))
        };
        let deps = HubDeps::system(&config, store)?;
        Ok(Self::new(config, deps))
    }

    pub fn new(config: AppConfig, deps: HubDeps) -> Arc<Self> {
        let http = reqwest::Client::new();
        let events = Arc::new(BroadcastSink::default());

        let oracle = Arc::new(LivenessOracle::new(
            deps.store.clone(),
            http.clone(),
            deps.probe,
            Duration::from_secs(config.liveness.probe_timeout_secs),
        ));
        let ghosts = Arc::new(GhostCache::new(
            oracle.clone(),
            deps.store.clone(),
            Duration::from_secs(config.liveness.ghost_refresh_secs),
        ));

        let supervisor = match (deps.launcher, config.backend.supervisor_config()) {
            (Some(launcher), Ok(sup_config)) => Some(Arc::new(BackendSupervisor::new(
                sup_config,
                launcher,
                http.clone(),
                events.clone(),
            ))),
            (Some(_), Err(e)) => {
                warn!("opencode server disabled: {:#}", e);
                None
            }
            (None, _) => None,
        };
        let runner = deps.runner;
        let dispatcher = Arc::new(Dispatcher::new(
            supervisor.clone(),
            runner.clone(),
            deps.store.clone(),
        ));

        let queue = Arc::new(DirectQueue::new(
            deps.store.clone(),
            dispatcher,
            deps.registries,
            events.clone(),
            config.direct.queue_config(),
        ));
        let agents = Arc::new(AgentService::new(
            deps.store.clone(),
            deps.resolver.clone(),
            events.clone(),
        ));
        let router = Arc::new(InvocationRouter::new(
            deps.store.clone(),
            oracle.clone(),
            deps.resolver.clone(),
            events.clone(),
            queue.clone(),
            http,
            Duration::from_secs(config.invocation.prompt_timeout_secs),
        ));

        Arc::new(Self {
            direct_mode: config.direct.mode,
            config,
            store: deps.store,
            events,
            oracle,
            ghosts,
            resolver: deps.resolver,
            agents,
            queue,
            router,
            supervisor,
            runner,
        })
    }

    /// Start the background loops. The OpenCode server itself starts on first use.
    pub async fn start(&self) {
        self.ghosts.start().await;
        self.queue.start_sweeper().await;
    }

    /// Stop background loops, drain in-flight invocations and stop owned servers.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.router.shutdown().await;
        self.queue.stop_sweeper().await;
        self.ghosts.stop().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop().await;
        }
    }

    /// Binaries one-shot delivery would run, keyed by CLI type.
    pub fn cli_binaries(&self) -> HashMap<String, String> {
        [AgentType::Opencode, AgentType::Claude, AgentType::Codex]
            .into_iter()
            .filter_map(|cli| {
                let path = self.runner.program_for(cli).ok()?;
                Some((cli.to_string(), path.display().to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, RegisterRequest};
    use crate::liveness::testing::FixedProbe;
    use crate::store::AgentStore;

    fn deps() -> HubDeps {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        HubDeps {
            store,
            resolver: Arc::new(DiscoveryResolver::new(
                vec![],
                Arc::new(StaticLocator::new(None)),
            )),
            registries: Arc::new(RegistrySet::default()),
            probe: Arc::new(FixedProbe::with(&[4242])),
            launcher: None,
            runner: SubprocessRunner::default(),
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown_loops() {
        let hub = Hub::new(AppConfig::default(), deps());
        hub.start().await;
        assert!(hub.ghosts.is_running().await);
        hub.shutdown().await;
        assert!(!hub.ghosts.is_running().await);
        assert!(hub.supervisor.is_none());
    }

    #[tokio::test]
    async fn test_registered_agent_is_visible_to_router() {
        let hub = Hub::new(AppConfig::default(), deps());
        hub.agents
            .register(RegisterRequest {
                name: "nibex".into(),
                agent_type: AgentType::Opencode,
                project_path: "/src/app".into(),
                pid: 4242,
                tty: String::new(),
                credential: None,
                profile: None,
            })
            .await
            .unwrap();
        // Registered process is alive, so not a ghost, but no session is known.
        assert!(!hub.router.is_ghost("nibex").await.unwrap());
        assert!(!hub.router.is_invocable("nibex").await.unwrap());
        assert!(hub.store.get_agent("nibex").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ephemeral_open() {
        let mut config = AppConfig::default();
        config.database.ephemeral = true;
        config.backend.opencode_server = false;
        config.discovery.server_url = Some("http://127.0.0.1:1".into());
        let hub = Hub::open(config).await.unwrap();
        let agent = AgentIdentity::new("quill", AgentType::Claude, "/q");
        hub.store.upsert_agent(&agent).await.unwrap();
        assert_eq!(hub.store.list_agents().await.unwrap().len(), 1);
    }
}
