//! Layered configuration: defaults, then the TOML file, then `TETHER__*` env vars.

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::SupervisorConfig;
use crate::queue::{DirectConfig, DirectMode};

pub const APP_NAME: &str = "tether";

const ENV_PREFIX: &str = "TETHER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub discovery: DiscoverySettings,
    pub liveness: LivenessSettings,
    pub backend: BackendSettings,
    pub invocation: InvocationSettings,
    pub direct: DirectSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Required in `X-Internal-Secret` on every route but `/health` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_secret: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            internal_secret: None,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to `$XDG_DATA_HOME/tether/tether.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Keep everything in memory; nothing survives a restart.
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Fixed CLI server URL. When unset the server is located with `lsof`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub max_pid_hops: usize,
    pub process_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Registry entries older than this are ignored.
    pub registry_max_age_hours: i64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            server_url: None,
            max_pid_hops: 20,
            process_timeout_secs: 3,
            probe_timeout_secs: 5,
            registry_max_age_hours: 720,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    pub probe_timeout_secs: u64,
    pub ghost_refresh_secs: u64,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 5,
            ghost_refresh_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Supervise a persistent `opencode serve`. When off, only subprocesses are used.
    pub opencode_server: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub health_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub watchdog_interval_secs: u64,
    /// Explicit CLI binaries by type name (`opencode`, `claude`, `codex`).
    pub cli_paths: HashMap<String, String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            opencode_server: true,
            port: 4096,
            working_dir: None,
            health_timeout_secs: 5,
            start_timeout_secs: 60,
            session_timeout_secs: 30,
            stop_grace_secs: 5,
            watchdog_interval_secs: 30,
            cli_paths: HashMap::new(),
        }
    }
}

impl BackendSettings {
    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        let working_dir = self
            .working_dir
            .as_deref()
            .map(expand_str_path)
            .transpose()?;
        Ok(SupervisorConfig {
            port: self.port,
            working_dir,
            health_timeout: Duration::from_secs(self.health_timeout_secs),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            watchdog_interval: Duration::from_secs(self.watchdog_interval_secs),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationSettings {
    pub prompt_timeout_secs: u64,
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            prompt_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectSettings {
    pub mode: DirectMode,
    pub poll_interval_ms: u64,
    pub smart_pull_wait_secs: u64,
    pub fallback_timeout_secs: u64,
    pub max_age_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for DirectSettings {
    fn default() -> Self {
        Self {
            mode: DirectMode::Auto,
            poll_interval_ms: 2000,
            smart_pull_wait_secs: 45,
            fallback_timeout_secs: 180,
            max_age_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl DirectSettings {
    pub fn queue_config(&self) -> DirectConfig {
        DirectConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            smart_pull_wait: Duration::from_secs(self.smart_pull_wait_secs),
            fallback_timeout: Duration::from_secs(self.fallback_timeout_secs),
            max_age: Duration::from_secs(self.max_age_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

impl AppConfig {
    /// Load `path` (or the default location), creating a default file when missing.
    pub fn load_or_init(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_file()?,
        };
        if !path.exists() {
            write_default_config(&path)?;
            info!("wrote default config to {}", path.display());
        }
        let config = Self::load_from(&path, None)?;
        Ok((config, path))
    }

    /// Layer `path` and the environment over the defaults.
    ///
    /// `env_source` replaces the process environment, for tests.
    pub fn load_from(path: &Path, env_source: Option<HashMap<String, String>>) -> Result<Self> {
        let built = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .source(env_source),
            )
            .build()
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config: AppConfig = built
            .try_deserialize()
            .context("parsing configuration")?;
        Ok(config)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => expand_str_path(path),
            None => Ok(default_data_dir()?.join("tether.db")),
        }
    }

    /// CLI binaries given explicitly in `backend.cli_paths`, expanded.
    pub fn cli_paths(&self) -> Result<HashMap<crate::agent::AgentType, PathBuf>> {
        let mut out = HashMap::new();
        for (name, path) in &self.backend.cli_paths {
            let cli = name
                .parse()
                .map_err(|e: String| anyhow!("backend.cli_paths: {e}"))?;
            out.insert(cli, expand_str_path(path)?);
        }
        Ok(out)
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}
