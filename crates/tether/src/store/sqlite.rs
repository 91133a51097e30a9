//! SQLite-backed store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashSet;

use super::{AgentStore, DirectQueueStore, OsSessionStore, StoreError, StoreResult};
use crate::agent::{
    AgentIdentity, AgentProfile, AgentStatus, AgentType, InvocationCredential, OsSession,
    ProfileUpdate,
};
use crate::db::Database;
use crate::queue::{DirectQueueEntry, DirectStatus, QueueFilter};

const AGENT_COLUMNS: &str = "id, name, agent_type, project_path, project_name, status, \
     description, personality, current_task, gender, server_url, provider_session_id, \
     cli_session_id, backend_session_id, created_at, last_seen_at";

const DIRECT_COLUMNS: &str = "id, from_agent, to_agent, prompt, wrapped_prompt, status, \
     response, created_at, delivered_at, responded_at";

/// Store over the hub's SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

/// Fixed-width RFC 3339 so timestamps compare correctly as text.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{column}={raw}: {e}")))
}

fn parse_opt_ts(column: &str, raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(column, &r)).transpose()
}

fn agent_from_row(row: &SqliteRow) -> StoreResult<AgentIdentity> {
    let agent_type: String = row.try_get("agent_type")?;
    let status: String = row.try_get("status")?;
    let server_url: Option<String> = row.try_get("server_url")?;
    let session_id: Option<String> = row.try_get("provider_session_id")?;
    let created_at: String = row.try_get("created_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;

    let credential = match (server_url, session_id) {
        (Some(server_url), Some(session_id)) => Some(InvocationCredential {
            server_url,
            session_id,
        }),
        _ => None,
    };

    Ok(AgentIdentity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        agent_type: agent_type.parse().map_err(StoreError::Corrupt)?,
        project_path: row.try_get("project_path")?,
        project_name: row.try_get("project_name")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        profile: AgentProfile {
            description: row.try_get("description")?,
            personality: row.try_get("personality")?,
            current_task: row.try_get("current_task")?,
            gender: row.try_get("gender")?,
        },
        credential,
        cli_session_id: row.try_get("cli_session_id")?,
        backend_session_id: row.try_get("backend_session_id")?,
        created_at: parse_ts("created_at", &created_at)?,
        last_seen_at: parse_ts("last_seen_at", &last_seen_at)?,
    })
}

fn os_session_from_row(row: &SqliteRow) -> StoreResult<OsSession> {
    let pid: i64 = row.try_get("pid")?;
    let started_at: String = row.try_get("started_at")?;
    Ok(OsSession {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        pid: u32::try_from(pid).map_err(|_| StoreError::Corrupt(format!("pid={pid}")))?,
        tty: row.try_get("tty")?,
        is_active: row.try_get::<i64, _>("is_active")? != 0,
        started_at: parse_ts("started_at", &started_at)?,
        ended_at: parse_opt_ts("ended_at", row.try_get("ended_at")?)?,
    })
}

fn direct_from_row(row: &SqliteRow) -> StoreResult<DirectQueueEntry> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(DirectQueueEntry {
        id: row.try_get("id")?,
        from_agent: row.try_get("from_agent")?,
        to_agent: row.try_get("to_agent")?,
        prompt: row.try_get("prompt")?,
        wrapped_prompt: row.try_get("wrapped_prompt")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        response: row.try_get("response")?,
        created_at: parse_ts("created_at", &created_at)?,
        delivered_at: parse_opt_ts("delivered_at", row.try_get("delivered_at")?)?,
        responded_at: parse_opt_ts("responded_at", row.try_get("responded_at")?)?,
    })
}

impl SqliteStore {
    fn require_update(&self, name: &str, rows: u64) -> StoreResult<()> {
        if rows == 0 {
            return Err(StoreError::AgentNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn fetch_agent(&self, name: &str) -> StoreResult<AgentIdentity> {
        self.get_agent(name)
            .await?
            .ok_or_else(|| StoreError::AgentNotFound(name.to_string()))
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn upsert_agent(&self, agent: &AgentIdentity) -> StoreResult<AgentIdentity> {
        let (server_url, session_id) = match &agent.credential {
            Some(c) => (Some(c.server_url.as_str()), Some(c.session_id.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO agents (id, name, agent_type, project_path, project_name, status,
                description, personality, current_task, gender, server_url, provider_session_id,
                cli_session_id, backend_session_id, created_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                agent_type = excluded.agent_type,
                project_path = excluded.project_path,
                project_name = excluded.project_name,
                status = excluded.status,
                description = excluded.description,
                personality = excluded.personality,
                current_task = excluded.current_task,
                gender = excluded.gender,
                server_url = excluded.server_url,
                provider_session_id = excluded.provider_session_id,
                cli_session_id = excluded.cli_session_id,
                backend_session_id = excluded.backend_session_id,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(agent.agent_type.as_str())
        .bind(&agent.project_path)
        .bind(&agent.project_name)
        .bind(agent.status.to_string())
        .bind(&agent.profile.description)
        .bind(&agent.profile.personality)
        .bind(&agent.profile.current_task)
        .bind(&agent.profile.gender)
        .bind(server_url)
        .bind(session_id)
        .bind(&agent.cli_session_id)
        .bind(&agent.backend_session_id)
        .bind(ts(agent.created_at))
        .bind(ts(agent.last_seen_at))
        .execute(&self.pool)
        .await?;

        self.fetch_agent(&agent.name).await
    }

    async fn get_agent(&self, name: &str) -> StoreResult<Option<AgentIdentity>> {
        let row = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn list_agents(&self) -> StoreResult<Vec<AgentIdentity>> {
        let rows = sqlx::query(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY name"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn set_status(&self, name: &str, status: AgentStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET status = ? WHERE name = ?")
            .bind(status.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_update(name, result.rows_affected())
    }

    async fn set_agent_type(&self, name: &str, agent_type: AgentType) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET agent_type = ? WHERE name = ?")
            .bind(agent_type.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_update(name, result.rows_affected())
    }

    async fn touch(&self, name: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET last_seen_at = ? WHERE name = ?")
            .bind(ts(Utc::now()))
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_update(name, result.rows_affected())
    }

    async fn update_profile(&self, name: &str, update: &ProfileUpdate) -> StoreResult<AgentIdentity> {
        let result = sqlx::query(
            r#"
            UPDATE agents SET
                description = COALESCE(?, description),
                personality = COALESCE(?, personality),
                current_task = COALESCE(?, current_task),
                gender = COALESCE(?, gender)
            WHERE name = ?
            "#,
        )
        .bind(&update.description)
        .bind(&update.personality)
        .bind(&update.current_task)
        .bind(&update.gender)
        .bind(name)
        .execute(&self.pool)
        .await?;
        self.require_update(name, result.rows_affected())?;
        self.fetch_agent(name).await
    }

    async fn claim_credential(
        &self,
        name: &str,
        credential: &InvocationCredential,
    ) -> StoreResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE agents SET server_url = ?, provider_session_id = ? WHERE name = ?",
        )
        .bind(&credential.server_url)
        .bind(&credential.session_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AgentNotFound(name.to_string()));
        }

        let cleared: Vec<String> = sqlx::query(
            "SELECT name FROM agents WHERE provider_session_id = ? AND name != ? ORDER BY name",
        )
        .bind(&credential.session_id)
        .bind(name)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get("name"))
        .collect::<Result<_, _>>()?;

        sqlx::query(
            "UPDATE agents SET server_url = NULL, provider_session_id = NULL \
             WHERE provider_session_id = ? AND name != ?",
        )
        .bind(&credential.session_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(cleared)
    }

    async fn clear_credential(&self, name: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE agents SET server_url = NULL, provider_session_id = NULL WHERE name = ?",
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        self.require_update(name, result.rows_affected())
    }

    async fn claimed_session_ids(&self, except: &str) -> StoreResult<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT provider_session_id FROM agents \
             WHERE provider_session_id IS NOT NULL AND name != ?",
        )
        .bind(except)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("provider_session_id").map_err(StoreError::from))
            .collect()
    }

    async fn set_cli_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET cli_session_id = ? WHERE name = ?")
            .bind(session_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_update(name, result.rows_affected())
    }

    async fn set_backend_session(&self, name: &str, session_id: Option<&str>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE agents SET backend_session_id = ? WHERE name = ?")
            .bind(session_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_update(name, result.rows_affected())
    }
}

#[async_trait]
impl OsSessionStore for SqliteStore {
    async fn open_os_session(&self, agent_id: &str, pid: u32, tty: &str) -> StoreResult<OsSession> {
        let now = Utc::now();
        let session = OsSession {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            pid,
            tty: tty.to_string(),
            is_active: true,
            started_at: now,
            ended_at: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE os_sessions SET is_active = 0, ended_at = ? WHERE agent_id = ? AND is_active = 1",
        )
        .bind(ts(now))
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO os_sessions (id, agent_id, pid, tty, is_active, started_at) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(&session.id)
        .bind(agent_id)
        .bind(i64::from(pid))
        .bind(tty)
        .bind(ts(now))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(session)
    }

    async fn active_os_session(&self, agent_id: &str) -> StoreResult<Option<OsSession>> {
        let row = sqlx::query(
            "SELECT id, agent_id, pid, tty, is_active, started_at, ended_at FROM os_sessions \
             WHERE agent_id = ? AND is_active = 1 ORDER BY started_at DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(os_session_from_row).transpose()
    }

    async fn close_os_sessions(&self, agent_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE os_sessions SET is_active = 0, ended_at = ? WHERE agent_id = ? AND is_active = 1",
        )
        .bind(ts(Utc::now()))
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DirectQueueStore for SqliteStore {
    async fn insert_direct(&self, entry: &DirectQueueEntry) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO direct_queue ({DIRECT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&entry.id)
        .bind(&entry.from_agent)
        .bind(&entry.to_agent)
        .bind(&entry.prompt)
        .bind(&entry.wrapped_prompt)
        .bind(entry.status.as_str())
        .bind(&entry.response)
        .bind(ts(entry.created_at))
        .bind(entry.delivered_at.map(ts))
        .bind(entry.responded_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_direct(&self, id: &str) -> StoreResult<Option<DirectQueueEntry>> {
        let row = sqlx::query(&format!("SELECT {DIRECT_COLUMNS} FROM direct_queue WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(direct_from_row).transpose()
    }

    async fn transition_direct(
        &self,
        id: &str,
        next: DirectStatus,
        response: Option<&str>,
    ) -> StoreResult<bool> {
        let allowed = next.predecessors();
        if allowed.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; allowed.len()].join(", ");
        let now = ts(Utc::now());

        let set_clause = match next {
            DirectStatus::Delivered => "status = ?, delivered_at = ?",
            DirectStatus::Responded => "status = ?, responded_at = ?, response = ?",
            _ => "status = ?",
        };
        let sql =
            format!("UPDATE direct_queue SET {set_clause} WHERE id = ? AND status IN ({placeholders})");

        let mut query = sqlx::query(&sql).bind(next.as_str());
        match next {
            DirectStatus::Delivered => query = query.bind(now),
            DirectStatus::Responded => query = query.bind(now).bind(response),
            _ => {}
        }
        query = query.bind(id);
        for status in allowed {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn take_pending_direct(&self, to_agent: &str) -> StoreResult<Vec<DirectQueueEntry>> {
        let rows = sqlx::query(&format!(
            "UPDATE direct_queue SET status = 'delivered', delivered_at = ? \
             WHERE to_agent = ? AND status = 'pending' RETURNING {DIRECT_COLUMNS}"
        ))
        .bind(ts(Utc::now()))
        .bind(to_agent)
        .fetch_all(&self.pool)
        .await?;
        let mut entries = rows
            .iter()
            .map(direct_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn expire_direct_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE direct_queue SET status = 'expired' \
             WHERE status IN ('pending', 'delivered') AND created_at < ?",
        )
        .bind(ts(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_direct(&self, filter: &QueueFilter) -> StoreResult<Vec<DirectQueueEntry>> {
        let mut sql = format!("SELECT {DIRECT_COLUMNS} FROM direct_queue WHERE 1 = 1");
        if filter.to_agent.is_some() {
            sql.push_str(" AND to_agent = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(to) = &filter.to_agent {
            query = query.bind(to);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        query = query.bind(i64::from(filter.effective_limit()));

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(direct_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        let db = Database::in_memory().await.unwrap();
        SqliteStore::new(&db)
    }

    #[tokio::test]
    async fn test_agent_roundtrip_with_credential() {
        let store = store().await;
        let mut agent = AgentIdentity::new("nibex", AgentType::Opencode, "/home/dev/proj");
        agent.credential = Some(InvocationCredential::new("http://127.0.0.1:4096", "ses_abc"));
        agent.profile.description = Some("refactors things".into());

        let saved = store.upsert_agent(&agent).await.unwrap();
        assert_eq!(saved.id, agent.id);
        assert_eq!(saved.credential, agent.credential);
        assert_eq!(saved.profile.description.as_deref(), Some("refactors things"));
    }

    #[tokio::test]
    async fn test_claim_credential_transfers_session() {
        let store = store().await;
        for name in ["nibex", "yara"] {
            store
                .upsert_agent(&AgentIdentity::new(name, AgentType::Opencode, "/p"))
                .await
                .unwrap();
        }
        let cred = InvocationCredential::new("http://127.0.0.1:4096", "ses_abc");
        store.claim_credential("nibex", &cred).await.unwrap();
        let cleared = store.claim_credential("yara", &cred).await.unwrap();

        assert_eq!(cleared, vec!["nibex".to_string()]);
        assert!(store.get_agent("nibex").await.unwrap().unwrap().credential.is_none());
        assert!(store.claimed_session_ids("nibex").await.unwrap().contains("ses_abc"));
        assert!(store.claimed_session_ids("yara").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_unknown_agent_fails() {
        let store = store().await;
        let cred = InvocationCredential::new("http://127.0.0.1:4096", "ses_abc");
        let err = store.claim_credential("ghost", &cred).await.unwrap_err();
        assert!(matches!(err, StoreError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_is_monotonic() {
        let store = store().await;
        let entry = DirectQueueEntry::new("yara", "nibex", "ping", "[DM] ping");
        store.insert_direct(&entry).await.unwrap();

        assert!(store.transition_direct(&entry.id, DirectStatus::Fallback, None).await.unwrap());
        assert!(!store
            .transition_direct(&entry.id, DirectStatus::Responded, Some("late"))
            .await
            .unwrap());
        let stored = store.get_direct(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DirectStatus::Fallback);
        assert!(stored.response.is_none());
    }

    #[tokio::test]
    async fn test_take_pending_and_list() {
        let store = store().await;
        let first = DirectQueueEntry::new("yara", "nibex", "one", "one");
        let second = DirectQueueEntry::new("yara", "nibex", "two", "two");
        store.insert_direct(&first).await.unwrap();
        store.insert_direct(&second).await.unwrap();

        let taken = store.take_pending_direct("nibex").await.unwrap();
        assert_eq!(taken.len(), 2);
        assert!(taken.iter().all(|e| e.status == DirectStatus::Delivered));

        let listed = store
            .list_direct(&QueueFilter {
                to_agent: Some("nibex".into()),
                status: Some(DirectStatus::Delivered),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_os_session_rotation() {
        let store = store().await;
        let agent = store
            .upsert_agent(&AgentIdentity::new("nibex", AgentType::Claude, "/p"))
            .await
            .unwrap();
        store.open_os_session(&agent.id, 10, "/dev/pts/1").await.unwrap();
        let second = store.open_os_session(&agent.id, 20, "/dev/pts/2").await.unwrap();

        let active = store.active_os_session(&agent.id).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.pid, 20);
    }
}
