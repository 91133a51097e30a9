//! The concrete discovery strategies.

use async_trait::async_trait;
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::process::{ProcessTable, is_interactive_cli, session_flag};
use super::registry::RegistrySet;
use super::{DiscoveryHints, SessionRef, SessionStrategy, directory_matches};
use crate::agent::AgentType;
use crate::opencode::OpenCodeClient;

/// Climb the parent chain from the agent's pid looking for a CLI started with a session flag.
pub struct PidAncestry {
    processes: Arc<dyn ProcessTable>,
    binary: &'static str,
    max_hops: usize,
}

impl PidAncestry {
    pub fn new(processes: Arc<dyn ProcessTable>, binary: &'static str, max_hops: usize) -> Self {
        Self {
            processes,
            binary,
            max_hops,
        }
    }
}

#[async_trait]
impl SessionStrategy for PidAncestry {
    fn name(&self) -> &'static str {
        "pid_ancestry"
    }

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        let mut current = hints.pid?;
        let mut visited = HashSet::new();

        for _ in 0..self.max_hops {
            if current <= 1 || !visited.insert(current) {
                break;
            }
            let (ppid, cmdline) = self.processes.parent_of(current).await?;
            if cmdline.contains(self.binary) {
                if let Some(id) = session_flag(&cmdline) {
                    debug!("pid {} has session {} (walked from {:?})", current, id, hints.pid);
                    return Some(SessionRef {
                        session_id: id.to_string(),
                        strategy: self.name(),
                    });
                }
            }
            current = ppid;
        }
        None
    }
}

/// Look for the CLI among processes attached to the agent's terminal.
pub struct TtyScan {
    processes: Arc<dyn ProcessTable>,
    binary: &'static str,
}

impl TtyScan {
    pub fn new(processes: Arc<dyn ProcessTable>, binary: &'static str) -> Self {
        Self { processes, binary }
    }
}

#[async_trait]
impl SessionStrategy for TtyScan {
    fn name(&self) -> &'static str {
        "tty_scan"
    }

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        let tty = hints.tty.as_deref().filter(|t| !t.is_empty() && *t != "unknown")?;
        self.processes
            .on_tty(tty)
            .await
            .iter()
            .filter(|line| line.contains(self.binary) && !line.contains("serve"))
            .find_map(|line| session_flag(line))
            .map(|id| SessionRef {
                session_id: id.to_string(),
                strategy: self.name(),
            })
    }
}

/// Enumerate every interactive CLI process and match its session's directory
/// from the on-disk registries against the project path.
pub struct ProcessScan {
    processes: Arc<dyn ProcessTable>,
    registries: RegistrySet,
    cli: AgentType,
}

impl ProcessScan {
    pub fn new(processes: Arc<dyn ProcessTable>, registries: RegistrySet) -> Self {
        Self {
            processes,
            registries,
            cli: AgentType::Opencode,
        }
    }
}

#[async_trait]
impl SessionStrategy for ProcessScan {
    fn name(&self) -> &'static str {
        "process_scan"
    }

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        let binary = self.cli.cli_binary()?;
        let candidates: Vec<String> = self
            .processes
            .all()
            .await
            .iter()
            .filter(|line| is_interactive_cli(line, binary))
            .filter_map(|line| session_flag(line).map(str::to_string))
            .collect();

        for session_id in candidates {
            if hints.exclude.contains(&session_id) {
                continue;
            }
            let Some(directory) = self.registries.directory_of(self.cli, &session_id).await else {
                continue;
            };
            if directory_matches(&directory, &hints.project_path) {
                debug!("session {} (dir {}) matches {}", session_id, directory, hints.project_path);
                return Some(SessionRef {
                    session_id,
                    strategy: self.name(),
                });
            }
        }
        None
    }
}

/// Ask the CLI server for its sessions: newest root session in the project not claimed by anyone.
pub struct RemoteRegistry {
    http: reqwest::Client,
    timeout: Duration,
}

impl RemoteRegistry {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl SessionStrategy for RemoteRegistry {
    fn name(&self) -> &'static str {
        "remote_registry"
    }

    async fn resolve(&self, hints: &DiscoveryHints) -> Option<SessionRef> {
        let url = hints.server_url.as_deref()?;
        let client = OpenCodeClient::with_client(self.http.clone(), url);
        let sessions = match client.list_sessions(self.timeout).await {
            Ok(sessions) => sessions,
            Err(e) => {
                debug!("listing sessions on {} failed: {}", url, e);
                return None;
            }
        };

        let mut candidates: Vec<_> = sessions
            .into_iter()
            .filter(|s| s.is_root())
            .filter(|s| {
                s.directory
                    .as_deref()
                    .is_some_and(|d| directory_matches(d, &hints.project_path))
            })
            .collect();
        candidates.sort_by_key(|s| std::cmp::Reverse(s.updated()));

        candidates
            .into_iter()
            .find(|s| !hints.exclude.contains(&s.id))
            .map(|s| SessionRef {
                session_id: s.id,
                strategy: self.name(),
            })
    }
}
