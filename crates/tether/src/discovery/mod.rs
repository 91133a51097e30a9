//! Session discovery.
//!
//! Given hints about a logical agent (project path, pid, tty, and the session
//! ids other agents already hold) the [`DiscoveryResolver`] runs an ordered
//! list of [`SessionStrategy`] values and stops at the first hit:
//!
//! 1. [`PidAncestry`]: walk up the parent chain from the agent's pid.
//! 2. [`TtyScan`]: look at processes on the agent's terminal.
//! 3. [`ProcessScan`]: every running CLI process, cross-checked against on-disk registries.
//! 4. [`RemoteRegistry`]: the CLI server's own `GET /session` listing.
//!
//! Discovery has no side effects and never fails: "not found" is `None`.

mod locator;
mod process;
mod registry;
mod strategies;

use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::Arc;

use crate::agent::InvocationCredential;

pub use locator::{LsofLocator, ServerLocator, StaticLocator};
pub use process::{PsProcessTable, ProcessTable, is_interactive_cli, pid_alive, session_flag};
pub use registry::{
    ClaudeRegistry, CodexRegistry, OpenCodeDbRegistry, OpenCodeStorageRegistry, RegistryEntry,
    RegistrySet, SessionRegistry, claude_project_dirname, normalize_path,
};
pub use strategies::{PidAncestry, ProcessScan, RemoteRegistry, TtyScan};

/// What is known about the agent being located.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryHints {
    pub project_path: String,
    pub pid: Option<u32>,
    pub tty: Option<String>,
    /// Session ids already held by other agents.
    pub exclude: HashSet<String>,
    /// Base URL of the CLI server, when one has been located.
    pub server_url: Option<String>,
}

impl DiscoveryHints {
    pub fn for_project(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            ..Default::default()
        }
    }
}

/// A discovered CLI session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: String,
    /// Name of the strategy that found it.
    pub strategy: &'static str,
}

/// One way of finding a session.
#[async_trait]
pub trait SessionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef>;
}

/// Whether a session's directory belongs to `project_path`.
///
/// Accepts equality and parent/child paths in either direction, so a session opened
/// in `/src/app` also matches a project registered at `/src`. Nested projects can
/// therefore pick up each other's sessions.
pub fn directory_matches(directory: &str, project_path: &str) -> bool {
    let dir = directory.trim_end_matches('/');
    let project = project_path.trim_end_matches('/');
    if dir.is_empty() || project.is_empty() {
        return false;
    }
    dir == project
        || dir
            .strip_prefix(project)
            .is_some_and(|rest| rest.starts_with('/'))
        || project
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Ordered strategy chain plus the server locator.
pub struct DiscoveryResolver {
    strategies: Vec<Box<dyn SessionStrategy>>,
    locator: Arc<dyn ServerLocator>,
}

impl DiscoveryResolver {
    pub fn new(strategies: Vec<Box<dyn SessionStrategy>>, locator: Arc<dyn ServerLocator>) -> Self {
        Self {
            strategies,
            locator,
        }
    }

    /// The four standard strategies for OpenCode, in priority order.
    pub fn standard(
        processes: Arc<dyn ProcessTable>,
        registries: RegistrySet,
        http: reqwest::Client,
        locator: Arc<dyn ServerLocator>,
        max_hops: usize,
        probe_timeout: std::time::Duration,
    ) -> Self {
        Self::new(
            vec![
                Box::new(PidAncestry::new(processes.clone(), "opencode", max_hops)),
                Box::new(TtyScan::new(processes.clone(), "opencode")),
                Box::new(ProcessScan::new(processes, registries)),
                Box::new(RemoteRegistry::new(http, probe_timeout)),
            ],
            locator,
        )
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run the chain, stopping at the first strategy that finds a session.
    pub async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        for strategy in &self.strategies {
            if let Some(found) = strategy.resolve(hints).await {
                info!(
                    "discovered session {} for {} via {}",
                    found.session_id, hints.project_path, found.strategy
                );
                return Some(found);
            }
            debug!("{} found nothing for {}", strategy.name(), hints.project_path);
        }
        None
    }

    /// Locate a running CLI server, then resolve a session on it.
    ///
    /// Returns `None` when no server is running: a session id alone cannot be invoked.
    pub async fn discover(&self, mut hints: DiscoveryHints) -> Option<InvocationCredential> {
        let server_url = match hints.server_url.clone() {
            Some(url) => url,
            None => self.locator.locate().await?,
        };
        hints.server_url = Some(server_url.clone());
        let found = self.resolve(&hints).await?;
        Some(InvocationCredential::new(server_url, found.session_id))
    }

    pub async fn locate_server(&self) -> Option<String> {
        self.locator.locate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        result: Option<&'static str>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl SessionStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _hints: &DiscoveryHints) -> Option<SessionRef> {
            self.calls.lock().unwrap().push(self.name);
            self.result.map(|id| SessionRef {
                session_id: id.to_string(),
                strategy: self.name,
            })
        }
    }

    fn chain(results: [Option<&'static str>; 4]) -> (DiscoveryResolver, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let names = ["pid", "tty", "scan", "remote"];
        let strategies = names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                Box::new(Scripted {
                    name,
                    result,
                    calls: calls.clone(),
                }) as Box<dyn SessionStrategy>
            })
            .collect();
        let resolver = DiscoveryResolver::new(
            strategies,
            Arc::new(StaticLocator::new(Some("http://127.0.0.1:4096".into()))),
        );
        (resolver, calls)
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_success() {
        let (resolver, calls) = chain([None, Some("ses_tty"), Some("ses_scan"), Some("ses_remote")]);
        let found = resolver.resolve(&DiscoveryHints::for_project("/p")).await.unwrap();
        assert_eq!(found.session_id, "ses_tty");
        assert_eq!(*calls.lock().unwrap(), vec!["pid", "tty"]);
    }

    #[tokio::test]
    async fn test_chain_exhausts_in_order() {
        let (resolver, calls) = chain([None, None, None, None]);
        assert!(resolver.resolve(&DiscoveryHints::for_project("/p")).await.is_none());
        assert_eq!(*calls.lock().unwrap(), vec!["pid", "tty", "scan", "remote"]);
    }

    #[tokio::test]
    async fn test_discover_needs_a_server() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = DiscoveryResolver::new(
            vec![Box::new(Scripted {
                name: "pid",
                result: Some("ses_a"),
                calls: calls.clone(),
            })],
            Arc::new(StaticLocator::new(None)),
        );
        assert!(resolver.discover(DiscoveryHints::for_project("/p")).await.is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_returns_credential() {
        let (resolver, _) = chain([Some("ses_pid"), None, None, None]);
        let cred = resolver.discover(DiscoveryHints::for_project("/p")).await.unwrap();
        assert_eq!(cred, InvocationCredential::new("http://127.0.0.1:4096", "ses_pid"));
    }

    #[test]
    fn test_directory_matches() {
        assert!(directory_matches("/src/app", "/src/app/"));
        assert!(directory_matches("/src/app/web", "/src/app"));
        assert!(directory_matches("/src", "/src/app"));
        assert!(!directory_matches("/src/app-old", "/src/app"));
        assert!(!directory_matches("", "/src/app"));
    }
}
