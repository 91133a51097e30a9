//! Child processes for supervised servers.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::{BackendError, BackendResult};

/// Environment override that stops a spawned CLI from loading the hub's own
/// MCP integration, which would otherwise call back into the hub and deadlock.
pub const CONFIG_OVERRIDE_VAR: &str = "OPENCODE_CONFIG_CONTENT";
pub const CONFIG_OVERRIDE_VALUE: &str = r#"{"mcp":{"tether":{"enabled":false}}}"#;

/// Bytes of stderr kept for error reports.
const STDERR_CAPTURE: usize = 4096;
/// Characters of stderr quoted in an early-exit error.
const STDERR_QUOTE: usize = 500;

/// How a process ended.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExitReport {
    /// Leading part of stderr, for error messages.
    pub fn stderr_excerpt(&self) -> String {
        self.stderr.trim().chars().take(STDERR_QUOTE).collect()
    }
}

/// A running server process.
#[async_trait]
pub trait ServerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// `Some` once the process has exited.
    async fn exited(&mut self) -> Option<ExitReport>;

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    async fn terminate(&mut self, grace: Duration);
}

/// Spawns server processes on a port.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Whether something already listens on the port.
    fn port_in_use(&self, port: u16) -> bool {
        port_in_use(port)
    }

    async fn spawn(
        &self,
        port: u16,
        working_dir: Option<&Path>,
    ) -> BackendResult<Box<dyn ServerProcess>>;
}

/// Check whether a loopback port is taken.
pub fn port_in_use(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_err()
}

/// Handle to a spawned child with its stderr captured in the background.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<u32>,
    label: String,
    child: Child,
    stderr: Arc<Mutex<String>>,
    drain: Option<JoinHandle<()>>,
}

impl ChildProcess {
    /// Spawn `command` with stdin and stdout detached and stderr captured.
    pub fn spawn(mut command: Command, label: impl Into<String>) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let label = label.into();
        let stderr = Arc::new(Mutex::new(String::new()));

        let drain = child.stderr.take().map(|pipe| {
            let sink = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(mut buf) = sink.lock() else { break };
                    if buf.len() < STDERR_CAPTURE {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            })
        });

        let pid = child.id();
        debug!("spawned {} (pid {:?})", label, pid);
        Ok(Self {
            pid,
            label,
            child,
            stderr,
            drain,
        })
    }

    fn captured_stderr(&self) -> String {
        self.stderr
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    /// Wait for the stderr reader to reach EOF so the report is complete.
    async fn finish_drain(&mut self) {
        if let Some(handle) = self.drain.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }

    fn signal_term(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: plain signal delivery to a child we spawned.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

#[async_trait]
impl ServerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn exited(&mut self) -> Option<ExitReport> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.finish_drain().await;
                Some(ExitReport {
                    code: status.code(),
                    stderr: self.captured_stderr(),
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("error checking {} status: {}", self.label, e);
                None
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        info!("stopping {} (pid {:?})", self.label, self.pid);
        self.signal_term();
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return;
        }

        warn!("{} ignored SIGTERM for {:?}, killing", self.label, grace);
        if let Err(e) = self.child.start_kill() {
            warn!("failed to kill {}: {}", self.label, e);
        }
        match tokio::time::timeout(Duration::from_secs(3), self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("error waiting for {}: {:?}", self.label, e),
            Err(_) => warn!("timeout waiting for {} to exit", self.label),
        }
    }
}

/// Launches `opencode serve` on the loopback interface.
#[derive(Debug, Clone)]
pub struct OpenCodeLauncher {
    binary: PathBuf,
    hostname: String,
}

impl OpenCodeLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            hostname: "127.0.0.1".to_string(),
        }
    }

    fn command(&self, port: u16, working_dir: Option<&Path>) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .arg("--hostname")
            .arg(&self.hostname)
            .env(CONFIG_OVERRIDE_VAR, CONFIG_OVERRIDE_VALUE);
        if let Some(dir) = working_dir.filter(|d| d.is_dir()) {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl ServerLauncher for OpenCodeLauncher {
    async fn spawn(
        &self,
        port: u16,
        working_dir: Option<&Path>,
    ) -> BackendResult<Box<dyn ServerProcess>> {
        info!(
            "spawning {} serve on port {} (cwd: {:?})",
            self.binary.display(),
            port,
            working_dir
        );
        let child = ChildProcess::spawn(self.command(port, working_dir), "opencode serve")
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BackendError::CliNotFound(self.binary.display().to_string())
                }
                _ => BackendError::Io(e),
            })?;
        Ok(Box::new(child))
    }
}
