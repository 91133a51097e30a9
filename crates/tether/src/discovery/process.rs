//! Local process inspection through `ps`.

use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::process::Command;

/// Session flag embedded in a CLI command line, e.g. `opencode -s ses_abc`.
static SESSION_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)(?:-s|--session)(?:\s+|=)(ses_\S+)").expect("valid session flag regex")
});

/// Extract the session id from a command line, if it carries one.
pub fn session_flag(cmdline: &str) -> Option<&str> {
    SESSION_FLAG
        .captures(cmdline)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Whether `cmdline` runs `binary` interactively (not as a server or one-shot run).
pub fn is_interactive_cli(cmdline: &str, binary: &str) -> bool {
    cmdline.contains(binary)
        && !cmdline.contains(" serve")
        && !cmdline.contains(&format!("{binary} run"))
}

/// Read-only view of the local process table.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Parent pid and full command line of `pid`.
    async fn parent_of(&self, pid: u32) -> Option<(u32, String)>;

    /// Command lines of processes attached to `tty`.
    async fn on_tty(&self, tty: &str) -> Vec<String>;

    /// Command lines of every process.
    async fn all(&self) -> Vec<String>;
}

/// [`ProcessTable`] backed by the `ps` binary.
#[derive(Debug, Clone)]
pub struct PsProcessTable {
    timeout: Duration,
}

impl PsProcessTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let output = Command::new("ps").args(args).kill_on_drop(true).output();
        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(out)) => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
            Ok(Err(e)) => {
                debug!("ps {:?} failed: {}", args, e);
                None
            }
            Err(_) => {
                debug!("ps {:?} timed out after {:?}", args, self.timeout);
                None
            }
        }
    }
}

impl Default for PsProcessTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl ProcessTable for PsProcessTable {
    async fn parent_of(&self, pid: u32) -> Option<(u32, String)> {
        let pid = pid.to_string();
        let stdout = self.run(&["-p", &pid, "-o", "ppid=,args="]).await?;
        parse_ppid_line(stdout.trim())
    }

    async fn on_tty(&self, tty: &str) -> Vec<String> {
        let short = tty.trim_start_matches("/dev/");
        self.run(&["-t", short, "-o", "args="])
            .await
            .map(|out| out.lines().map(|l| l.trim().to_string()).collect())
            .unwrap_or_default()
    }

    async fn all(&self) -> Vec<String> {
        self.run(&["axo", "args="])
            .await
            .map(|out| out.lines().map(|l| l.trim().to_string()).collect())
            .unwrap_or_default()
    }
}

/// Parse a `ps -o ppid=,args=` line.
fn parse_ppid_line(line: &str) -> Option<(u32, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let ppid = parts.next()?.trim().parse().ok()?;
    let args = parts.next().unwrap_or("").trim().to_string();
    Some((ppid, args))
}

/// Whether `pid` exists (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs no action beyond permission and existence checks.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
