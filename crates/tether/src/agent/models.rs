//! Agent data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of CLI backing an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Opencode,
    Claude,
    Codex,
    /// Hub-internal participant. Never invoked, never a ghost.
    System,
}

impl AgentType {
    /// Executable name of the CLI, if this type is backed by one.
    pub fn cli_binary(&self) -> Option<&'static str> {
        match self {
            AgentType::Opencode => Some("opencode"),
            AgentType::Claude => Some("claude"),
            AgentType::Codex => Some("codex"),
            AgentType::System => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Opencode => "opencode",
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::System => "system",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opencode" => Ok(AgentType::Opencode),
            "claude" | "claude_code" | "claude-code" => Ok(AgentType::Claude),
            "codex" => Ok(AgentType::Codex),
            "system" => Ok(AgentType::System),
            _ => Err(format!("unknown agent type: {}", s)),
        }
    }
}

/// Presence of an agent. Agents are never deleted, only marked offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            _ => Err(format!("unknown agent status: {}", s)),
        }
    }
}

/// Believed-live location of an agent's CLI backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationCredential {
    /// Base URL of the CLI's HTTP server (e.g. "http://127.0.0.1:4096").
    pub server_url: String,
    /// The CLI's own session id (e.g. "ses_...").
    pub session_id: String,
}

impl InvocationCredential {
    pub fn new(server_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            session_id: session_id.into(),
        }
    }
}

/// Free-form profile fields shown to other agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

/// Partial profile update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub description: Option<String>,
    pub personality: Option<String>,
    pub current_task: Option<String>,
    pub gender: Option<String>,
}

impl AgentProfile {
    pub fn apply(&mut self, update: &ProfileUpdate) {
        if let Some(v) = &update.description {
            self.description = Some(v.clone());
        }
        if let Some(v) = &update.personality {
            self.personality = Some(v.clone());
        }
        if let Some(v) = &update.current_task {
            self.current_task = Some(v.clone());
        }
        if let Some(v) = &update.gender {
            self.gender = Some(v.clone());
        }
    }
}

/// A registered logical agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    /// Unique display name, used for addressing.
    pub name: String,
    pub agent_type: AgentType,
    pub project_path: String,
    pub project_name: String,
    pub status: AgentStatus,
    #[serde(flatten)]
    pub profile: AgentProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<InvocationCredential>,
    /// Session id used to resume the CLI in one-shot subprocess mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_session_id: Option<String>,
    /// Session id on the supervised backend server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>, agent_type: AgentType, project_path: impl Into<String>) -> Self {
        let project_path = project_path.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            agent_type,
            project_name: project_name_of(&project_path),
            project_path,
            status: AgentStatus::Online,
            profile: AgentProfile::default(),
            credential: None,
            cli_session_id: None,
            backend_session_id: None,
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Whether a one-shot subprocess (or supervised server) could run a prompt for this agent.
    pub fn has_fallback_capability(&self) -> bool {
        self.agent_type.cli_binary().is_some()
            && (self.cli_session_id.is_some() || !self.project_path.is_empty())
    }
}

/// Last path component, used as a human-friendly project label.
pub fn project_name_of(project_path: &str) -> String {
    Path::new(project_path.trim_end_matches('/'))
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| project_path.to_string())
}

/// Local registration session tying an identity to a pid/tty lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsSession {
    pub id: String,
    pub agent_id: String,
    pub pid: u32,
    pub tty: String,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}
