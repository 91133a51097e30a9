//! One-shot CLI invocations.
//!
//! Each prompt spawns a fresh non-interactive CLI process that resumes the
//! agent's session (or continues the most recent one in its project dir).

use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::process::{CONFIG_OVERRIDE_VAR, CONFIG_OVERRIDE_VALUE};
use super::{BackendError, BackendKind, BackendResult, PromptOutcome};
use crate::agent::AgentType;

/// Fully built CLI invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory, only set when it exists.
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl DirectCommand {
    fn into_command(self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Build the non-interactive command line for a CLI.
///
/// - claude: `claude -p [-r SID | --continue] PROMPT`
/// - opencode: `opencode run [--session SID | --continue] PROMPT`
/// - codex: `codex exec [resume] --full-auto -c mcp_servers.tether.enabled=false [SID | -C DIR] PROMPT`
pub fn build_direct_command(
    cli: AgentType,
    program: PathBuf,
    prompt: &str,
    session_id: Option<&str>,
    working_dir: Option<&Path>,
) -> BackendResult<DirectCommand> {
    let cwd = working_dir.filter(|d| d.is_dir()).map(Path::to_path_buf);
    let mut env = Vec::new();
    let mut args: Vec<String> = Vec::new();

    match cli {
        AgentType::Claude => {
            args.push("-p".into());
            match session_id {
                Some(sid) => args.extend(["-r".into(), sid.to_string()]),
                None if cwd.is_some() => args.push("--continue".into()),
                None => {}
            }
        }
        AgentType::Opencode => {
            args.push("run".into());
            match session_id {
                Some(sid) => args.extend(["--session".into(), sid.to_string()]),
                None if cwd.is_some() => args.push("--continue".into()),
                None => {}
            }
            env.push((CONFIG_OVERRIDE_VAR.to_string(), CONFIG_OVERRIDE_VALUE.to_string()));
        }
        AgentType::Codex => {
            args.push("exec".into());
            if session_id.is_some() {
                args.push("resume".into());
            }
            args.extend([
                "--full-auto".into(),
                "-c".into(),
                "mcp_servers.tether.enabled=false".into(),
            ]);
            match (session_id, &cwd) {
                (Some(sid), _) => args.push(sid.to_string()),
                (None, Some(dir)) => {
                    args.extend(["-C".into(), dir.to_string_lossy().into_owned()])
                }
                (None, None) => {}
            }
        }
        AgentType::System => return Err(BackendError::Unsupported(cli.to_string())),
    }
    args.push(prompt.to_string());

    debug!(
        "built direct command: cli={} session={:?} cwd={:?} args={}",
        cli,
        session_id,
        cwd,
        args.len()
    );
    Ok(DirectCommand {
        program,
        args,
        cwd,
        env,
    })
}

/// Well-known install locations tried after `PATH`.
fn fallback_paths(cli: AgentType, home: &Path) -> Vec<PathBuf> {
    match cli {
        AgentType::Opencode => vec![
            home.join(".bun/bin/opencode"),
            home.join(".opencode/bin/opencode"),
        ],
        AgentType::Codex => vec![home.join(".npm-global/bin/codex")],
        AgentType::Claude => vec![
            home.join(".claude/local/claude"),
            home.join(".local/bin/claude"),
        ],
        AgentType::System => Vec::new(),
    }
}

/// Resolve a CLI to an executable path: `PATH` first, then known install
/// dirs, else the bare name (spawning then reports it missing).
pub fn resolve_cli(cli: AgentType, home: Option<&Path>) -> Option<PathBuf> {
    let binary = cli.cli_binary()?;
    if let Ok(path) = which::which(binary) {
        return Some(path);
    }
    if let Some(home) = home {
        if let Some(found) = fallback_paths(cli, home).into_iter().find(|p| p.is_file()) {
            info!("{} resolved via fallback: {}", binary, found.display());
            return Some(found);
        }
    }
    Some(PathBuf::from(binary))
}

/// Runs prompts through one-shot CLI processes.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    /// Explicit binaries per CLI, bypassing lookup.
    cli_paths: HashMap<AgentType, PathBuf>,
    home: Option<PathBuf>,
}

impl SubprocessRunner {
    pub fn new(cli_paths: HashMap<AgentType, PathBuf>) -> Self {
        Self {
            cli_paths,
            home: dirs::home_dir(),
        }
    }

    pub fn program_for(&self, cli: AgentType) -> BackendResult<PathBuf> {
        if let Some(path) = self.cli_paths.get(&cli) {
            return Ok(path.clone());
        }
        resolve_cli(cli, self.home.as_deref())
            .ok_or_else(|| BackendError::Unsupported(cli.to_string()))
    }

    /// Run `prompt` and wait up to `timeout` for the CLI to finish.
    ///
    /// A non-zero exit is an error carrying stderr; on timeout the child is killed.
    pub async fn run(
        &self,
        cli: AgentType,
        prompt: &str,
        session_id: Option<&str>,
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> BackendResult<PromptOutcome> {
        let program = self.program_for(cli)?;
        let direct = build_direct_command(cli, program, prompt, session_id, working_dir)?;
        let mut command = direct.into_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::CliNotFound(cli.to_string()),
            _ => BackendError::Io(e),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("{} subprocess timed out after {:?}", cli, timeout);
                return Err(BackendError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        info!(
            "{} subprocess finished: exit={:?} output_len={} error_len={} duration={:?}",
            cli,
            output.status.code(),
            stdout.len(),
            stderr.len(),
            started.elapsed()
        );

        if !output.status.success() {
            return Err(BackendError::Exit {
                code: output.status.code(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!("{} subprocess stderr: {}", cli, stderr.chars().take(200).collect::<String>());
        }
        Ok(PromptOutcome {
            output: stdout,
            session_id: session_id.map(str::to_string),
            backend: BackendKind::Subprocess,
            duration: started.elapsed(),
        })
    }
}
