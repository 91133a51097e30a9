//! On-disk session registries written by the CLIs themselves.
//!
//! Every registry is read-only and reduces to `session id → (directory, last updated)`.
//! Sessions older than the configured max age are ignored.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use log::{debug, info};
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::agent::AgentType;

/// A session found in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub session_id: String,
    pub directory: String,
    pub updated_at: DateTime<Utc>,
}

/// A CLI's own on-disk record of its sessions.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    fn cli(&self) -> AgentType;

    /// Working directory of `session_id`, if the registry knows it.
    async fn directory_of(&self, _session_id: &str) -> Option<String> {
        None
    }

    /// Most recently updated session whose directory is `project_path`.
    async fn latest_for(&self, _project_path: &str) -> Option<RegistryEntry> {
        None
    }
}

/// Normalise a path for comparison: resolved when it exists, without trailing slash.
pub fn normalize_path(path: &str) -> String {
    let resolved = fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string());
    let trimmed = resolved.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}

fn same_path(a: &str, b: &str) -> bool {
    normalize_path(a) == normalize_path(b)
}

fn keep_newest(best: &mut Option<RegistryEntry>, candidate: RegistryEntry) {
    if best.as_ref().is_none_or(|b| candidate.updated_at > b.updated_at) {
        *best = Some(candidate);
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn files_with_ext(dir: &Path, ext: &str) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|x| x == ext))
                .collect()
        })
        .unwrap_or_default()
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default()
}

/// OpenCode's embedded SQLite database (`opencode.db`).
#[derive(Debug, Clone)]
pub struct OpenCodeDbRegistry {
    path: PathBuf,
}

impl OpenCodeDbRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SessionRegistry for OpenCodeDbRegistry {
    fn cli(&self) -> AgentType {
        AgentType::Opencode
    }

    async fn directory_of(&self, session_id: &str) -> Option<String> {
        if !self.path.exists() {
            return None;
        }
        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .read_only(true)
            .busy_timeout(std::time::Duration::from_secs(2));
        let mut conn = match options.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("opening {} failed: {}", self.path.display(), e);
                return None;
            }
        };
        let row = sqlx::query("SELECT directory FROM session WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&mut conn)
            .await;
        match row {
            Ok(Some(row)) => row.try_get::<String, _>("directory").ok(),
            Ok(None) => None,
            Err(e) => {
                debug!("session lookup for {} failed: {}", session_id, e);
                None
            }
        }
    }
}

/// OpenCode's JSON storage tree (`storage/project/*.json`, `storage/session/<project>/*.json`).
#[derive(Debug, Clone)]
pub struct OpenCodeStorageRegistry {
    root: PathBuf,
    max_age: ChronoDuration,
}

impl OpenCodeStorageRegistry {
    pub fn new(root: impl Into<PathBuf>, max_age: ChronoDuration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    /// `(project id, worktree)` pairs.
    fn projects(&self) -> Vec<(String, String)> {
        files_with_ext(&self.root.join("project"), "json")
            .iter()
            .filter_map(|path| read_json(path))
            .filter_map(|v| {
                let id = v.get("id")?.as_str()?.to_string();
                let worktree = v.get("worktree")?.as_str()?.to_string();
                Some((id, worktree))
            })
            .collect()
    }

    fn sessions_of(&self, project_id: &str, worktree: &str) -> Vec<RegistryEntry> {
        let cutoff = Utc::now() - self.max_age;
        files_with_ext(&self.root.join("session").join(project_id), "json")
            .iter()
            .filter_map(|path| read_json(path))
            .filter_map(|v| {
                let session_id = v.get("id")?.as_str()?.to_string();
                let updated_ms = v.get("time")?.get("updated")?.as_i64()?;
                let updated_at = Utc.timestamp_millis_opt(updated_ms).single()?;
                let directory = v
                    .get("directory")
                    .and_then(Value::as_str)
                    .unwrap_or(worktree)
                    .to_string();
                Some(RegistryEntry {
                    session_id,
                    directory,
                    updated_at,
                })
            })
            .filter(|e| e.updated_at >= cutoff)
            .collect()
    }

    fn scan_latest(&self, project_path: &str) -> Option<RegistryEntry> {
        let (project_id, worktree) = self
            .projects()
            .into_iter()
            .find(|(_, worktree)| same_path(worktree, project_path))?;
        let mut best = None;
        for entry in self.sessions_of(&project_id, &worktree) {
            keep_newest(&mut best, entry);
        }
        best
    }

    fn scan_directory_of(&self, session_id: &str) -> Option<String> {
        self.projects().into_iter().find_map(|(project_id, worktree)| {
            self.sessions_of(&project_id, &worktree)
                .into_iter()
                .find(|e| e.session_id == session_id)
                .map(|e| e.directory)
        })
    }
}

#[async_trait]
impl SessionRegistry for OpenCodeStorageRegistry {
    fn cli(&self) -> AgentType {
        AgentType::Opencode
    }

    async fn directory_of(&self, session_id: &str) -> Option<String> {
        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || this.scan_directory_of(&session_id))
            .await
            .ok()
            .flatten()
    }

    async fn latest_for(&self, project_path: &str) -> Option<RegistryEntry> {
        let this = self.clone();
        let project_path = project_path.to_string();
        tokio::task::spawn_blocking(move || this.scan_latest(&project_path))
            .await
            .ok()
            .flatten()
    }
}

/// Claude Code's project store (`~/.claude/projects`).
#[derive(Debug, Clone)]
pub struct ClaudeRegistry {
    root: PathBuf,
    max_age: ChronoDuration,
}

/// Claude names project directories after the path with `:`, `\` and `/` replaced by `-`.
pub fn claude_project_dirname(project_path: &str) -> String {
    normalize_path(project_path).replace([':', '\\', '/'], "-")
}

impl ClaudeRegistry {
    pub fn new(root: impl Into<PathBuf>, max_age: ChronoDuration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    /// Entries from every `sessions-index.json`.
    fn indexed(&self) -> Vec<RegistryEntry> {
        let cutoff = Utc::now() - self.max_age;
        let mut entries = Vec::new();
        for dir in subdirs(&self.root) {
            let Some(index) = read_json(&dir.join("sessions-index.json")) else {
                continue;
            };
            let Some(list) = index.get("entries").and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                let parsed = (|| {
                    Some(RegistryEntry {
                        session_id: item.get("sessionId")?.as_str()?.to_string(),
                        directory: item.get("projectPath")?.as_str()?.to_string(),
                        updated_at: parse_iso(item.get("modified")?.as_str()?)?,
                    })
                })();
                if let Some(entry) = parsed.filter(|e| e.updated_at >= cutoff) {
                    entries.push(entry);
                }
            }
        }
        entries
    }

    fn scan_latest(&self, project_path: &str) -> Option<RegistryEntry> {
        let cutoff = Utc::now() - self.max_age;
        let mut best = None;

        for entry in self.indexed() {
            if same_path(&entry.directory, project_path) {
                keep_newest(&mut best, entry);
            }
        }

        // Live sessions are often missing from the index; their transcripts are named by session id.
        let project_dir = self.root.join(claude_project_dirname(project_path));
        for path in files_with_ext(&project_dir, "jsonl") {
            let Some(session_id) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };
            let Some(updated_at) = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
            else {
                continue;
            };
            if updated_at < cutoff {
                continue;
            }
            keep_newest(
                &mut best,
                RegistryEntry {
                    session_id,
                    directory: project_path.to_string(),
                    updated_at,
                },
            );
        }

        best
    }
}

#[async_trait]
impl SessionRegistry for ClaudeRegistry {
    fn cli(&self) -> AgentType {
        AgentType::Claude
    }

    async fn directory_of(&self, session_id: &str) -> Option<String> {
        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            this.indexed()
                .into_iter()
                .find(|e| e.session_id == session_id)
                .map(|e| e.directory)
        })
        .await
        .ok()
        .flatten()
    }

    async fn latest_for(&self, project_path: &str) -> Option<RegistryEntry> {
        let this = self.clone();
        let project_path = project_path.to_string();
        tokio::task::spawn_blocking(move || this.scan_latest(&project_path))
            .await
            .ok()
            .flatten()
    }
}

/// Codex rollout logs (`~/.codex/sessions/YYYY/MM/DD/*.jsonl`).
#[derive(Debug, Clone)]
pub struct CodexRegistry {
    root: PathBuf,
    max_age: ChronoDuration,
}

impl CodexRegistry {
    pub fn new(root: impl Into<PathBuf>, max_age: ChronoDuration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    /// Session metadata from the first line of every recent rollout file.
    fn entries(&self) -> Vec<RegistryEntry> {
        let cutoff = Utc::now() - self.max_age;
        let cutoff_date = cutoff.date_naive();
        let mut entries = Vec::new();

        for year_dir in subdirs(&self.root) {
            for month_dir in subdirs(&year_dir) {
                for day_dir in subdirs(&month_dir) {
                    let Some(date) = folder_date(&year_dir, &month_dir, &day_dir) else {
                        continue;
                    };
                    if date < cutoff_date {
                        continue;
                    }
                    for path in files_with_ext(&day_dir, "jsonl") {
                        if let Some(entry) = read_session_meta(&path).filter(|e| e.updated_at >= cutoff) {
                            entries.push(entry);
                        }
                    }
                }
            }
        }
        entries
    }
}

fn folder_date(year: &Path, month: &Path, day: &Path) -> Option<NaiveDate> {
    let num = |p: &Path| p.file_name()?.to_str()?.parse::<u32>().ok();
    NaiveDate::from_ymd_opt(i32::try_from(num(year)?).ok()?, num(month)?, num(day)?)
}

fn read_session_meta(path: &Path) -> Option<RegistryEntry> {
    let file = fs::File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let value: Value = serde_json::from_str(first.trim()).ok()?;
    if value.get("type")?.as_str()? != "session_meta" {
        return None;
    }
    let payload = value.get("payload")?;
    Some(RegistryEntry {
        session_id: payload.get("id")?.as_str()?.to_string(),
        directory: payload.get("cwd")?.as_str()?.to_string(),
        updated_at: parse_iso(payload.get("timestamp")?.as_str()?)?,
    })
}

#[async_trait]
impl SessionRegistry for CodexRegistry {
    fn cli(&self) -> AgentType {
        AgentType::Codex
    }

    async fn directory_of(&self, session_id: &str) -> Option<String> {
        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            this.entries()
                .into_iter()
                .find(|e| e.session_id == session_id)
                .map(|e| e.directory)
        })
        .await
        .ok()
        .flatten()
    }

    async fn latest_for(&self, project_path: &str) -> Option<RegistryEntry> {
        let this = self.clone();
        let project_path = project_path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut best = None;
            for entry in this.entries() {
                if same_path(&entry.directory, &project_path) {
                    keep_newest(&mut best, entry);
                }
            }
            best
        })
        .await
        .ok()
        .flatten()
    }
}

/// The registries a CLI type can be discovered through, in lookup order.
#[derive(Clone, Default)]
pub struct RegistrySet {
    registries: Vec<std::sync::Arc<dyn SessionRegistry>>,
}

impl RegistrySet {
    pub fn new(registries: Vec<std::sync::Arc<dyn SessionRegistry>>) -> Self {
        Self { registries }
    }

    /// Registries rooted at the CLIs' default locations under `home`.
    pub fn from_home(home: &Path, max_age: ChronoDuration) -> Self {
        let opencode = home.join(".local").join("share").join("opencode");
        Self::new(vec![
            std::sync::Arc::new(OpenCodeDbRegistry::new(opencode.join("opencode.db"))),
            std::sync::Arc::new(OpenCodeStorageRegistry::new(opencode.join("storage"), max_age)),
            std::sync::Arc::new(ClaudeRegistry::new(home.join(".claude").join("projects"), max_age)),
            std::sync::Arc::new(CodexRegistry::new(home.join(".codex").join("sessions"), max_age)),
        ])
    }

    pub async fn directory_of(&self, cli: AgentType, session_id: &str) -> Option<String> {
        for registry in self.registries.iter().filter(|r| r.cli() == cli) {
            if let Some(dir) = registry.directory_of(session_id).await {
                return Some(dir);
            }
        }
        None
    }

    /// Newest matching session across all registries for `cli`. Never fails.
    pub async fn latest_session(&self, cli: AgentType, project_path: &str) -> Option<RegistryEntry> {
        let mut best = None;
        for registry in self.registries.iter().filter(|r| r.cli() == cli) {
            if let Some(entry) = registry.latest_for(project_path).await {
                keep_newest(&mut best, entry);
            }
        }
        match &best {
            Some(entry) => info!(
                "{} session {} found for {}",
                cli, entry.session_id, project_path
            ),
            None => debug!("no {} session found for {}", cli, project_path),
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_opencode_storage_latest() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("proj");
        fs::create_dir_all(&project).unwrap();
        let worktree = project.to_string_lossy().to_string();
        let now_ms = Utc::now().timestamp_millis();

        let storage = tmp.path().join("storage");
        write(
            &storage.join("project/p1.json"),
            &json!({"id": "p1", "worktree": worktree}).to_string(),
        );
        write(
            &storage.join("session/p1/a.json"),
            &json!({"id": "ses_old", "time": {"updated": now_ms - 60_000}}).to_string(),
        );
        write(
            &storage.join("session/p1/b.json"),
            &json!({"id": "ses_new", "time": {"updated": now_ms}}).to_string(),
        );
        write(
            &storage.join("session/p1/c.json"),
            &json!({"id": "ses_ancient", "time": {"updated": 1_000}}).to_string(),
        );

        let registry = OpenCodeStorageRegistry::new(&storage, ChronoDuration::days(30));
        let latest = registry.latest_for(&worktree).await.unwrap();
        assert_eq!(latest.session_id, "ses_new");
        assert_eq!(
            registry.directory_of("ses_old").await.as_deref(),
            Some(worktree.as_str())
        );
        assert!(registry.directory_of("ses_ancient").await.is_none());
    }

    #[tokio::test]
    async fn test_claude_index_and_jsonl() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("work");
        fs::create_dir_all(&project).unwrap();
        let project_path = project.to_string_lossy().to_string();
        let root = tmp.path().join("projects");

        let old = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
        write(
            &root.join("indexed/sessions-index.json"),
            &json!({"entries": [
                {"sessionId": "indexed-1", "projectPath": project_path, "modified": old}
            ]})
            .to_string(),
        );
        write(
            &root
                .join(claude_project_dirname(&project_path))
                .join("live-2.jsonl"),
            "{}\n",
        );

        let registry = ClaudeRegistry::new(&root, ChronoDuration::days(30));
        let latest = registry.latest_for(&project_path).await.unwrap();
        assert_eq!(latest.session_id, "live-2");
        assert_eq!(
            registry.directory_of("indexed-1").await.as_deref(),
            Some(project_path.as_str())
        );
    }

    #[tokio::test]
    async fn test_codex_rollouts() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("repo");
        fs::create_dir_all(&project).unwrap();
        let cwd = project.to_string_lossy().to_string();
        let now = Utc::now();
        let day = tmp
            .path()
            .join("sessions")
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        write(
            &day.join("rollout-1.jsonl"),
            &format!(
                "{}\n{{\"type\":\"event\"}}\n",
                json!({"type": "session_meta", "payload": {
                    "id": "0199-codex", "cwd": cwd, "timestamp": now.to_rfc3339()
                }})
            ),
        );
        write(&day.join("rollout-2.jsonl"), "{\"type\":\"event\"}\n");

        let registry = CodexRegistry::new(tmp.path().join("sessions"), ChronoDuration::days(30));
        let latest = registry.latest_for(&cwd).await.unwrap();
        assert_eq!(latest.session_id, "0199-codex");
    }

    #[tokio::test]
    async fn test_missing_roots_yield_nothing() {
        let tmp = TempDir::new().unwrap();
        let set = RegistrySet::from_home(tmp.path(), ChronoDuration::days(30));
        assert!(set.latest_session(AgentType::Claude, "/nowhere").await.is_none());
        assert!(set.directory_of(AgentType::Opencode, "ses_x").await.is_none());
    }

    #[test]
    fn test_claude_dirname_encoding() {
        assert_eq!(claude_project_dirname("/does/not/exist/"), "-does-not-exist");
    }
}
