//! SQLite-backed state store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::StoreError;

/// Status of a sub-agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentStatus {
    Active,
    /// Persisted across a graceful shutdown; re-activated on restart.
    Detached,
    Terminated,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubAgentStatus::Active => "active",
            SubAgentStatus::Detached => "detached",
            SubAgentStatus::Terminated => "terminated",
        }
    }
}

impl FromStr for SubAgentStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubAgentStatus::Active),
            "detached" => Ok(SubAgentStatus::Detached),
            "terminated" => Ok(SubAgentStatus::Terminated),
            other => Err(StoreError::InvalidValue(format!(
                "unknown sub-agent status '{other}'"
            ))),
        }
    }
}

/// A persisted channel-to-session mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_key: String,
    pub agent: String,
    pub org: String,
    pub channel_id: String,
    pub channel_kind: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted stream cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRecord {
    pub agent: String,
    pub org: String,
    pub last_event_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// A persisted sub-agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRecord {
    pub sub_agent_id: String,
    pub parent_session_key: String,
    /// Name of the ephemeral credential, re-resolved after a restart.
    pub credential_ref: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: SubAgentStatus,
}

/// Handle to the local SQLite database.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_mappings (
                session_key  TEXT PRIMARY KEY,
                agent        TEXT NOT NULL,
                org          TEXT NOT NULL,
                channel_id   TEXT NOT NULL,
                channel_kind TEXT NOT NULL,
                created_at   TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_agent_channel
                ON session_mappings (agent, channel_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_cursors (
                agent         TEXT NOT NULL,
                org           TEXT NOT NULL,
                last_event_id INTEGER NOT NULL,
                updated_at    TEXT NOT NULL,
                PRIMARY KEY (agent, org)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sub_agent_sessions (
                sub_agent_id       TEXT PRIMARY KEY,
                parent_session_key TEXT NOT NULL,
                credential_ref     TEXT NOT NULL,
                expires_at         TEXT,
                status             TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- session mappings ---

    /// Insert a mapping; a no-op when one already exists for the same
    /// (agent, channel) pair.
    pub async fn upsert_mapping(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_mappings
                (session_key, agent, org, channel_id, channel_kind, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (agent, channel_id) DO NOTHING",
        )
        .bind(&record.session_key)
        .bind(&record.agent)
        .bind(&record.org)
        .bind(&record.channel_id)
        .bind(&record.channel_kind)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_mapping(
        &self,
        agent: &str,
        channel_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT session_key, agent, org, channel_id, channel_kind, created_at
             FROM session_mappings WHERE agent = ? AND channel_id = ?",
        )
        .bind(agent)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::mapping_from_row).transpose()
    }

    pub async fn mappings_for_agent(&self, agent: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_key, agent, org, channel_id, channel_kind, created_at
             FROM session_mappings WHERE agent = ? ORDER BY created_at",
        )
        .bind(agent)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::mapping_from_row).collect()
    }

    /// Delete a mapping; deleting an absent key is not an error.
    pub async fn delete_mapping(&self, session_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_mappings WHERE session_key = ?")
            .bind(session_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn mapping_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            session_key: row.try_get("session_key")?,
            agent: row.try_get("agent")?,
            org: row.try_get("org")?,
            channel_id: row.try_get("channel_id")?,
            channel_kind: row.try_get("channel_kind")?,
            created_at: row.try_get("created_at")?,
        })
    }

    // --- event cursors ---

    pub async fn cursor(&self, agent: &str, org: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT last_event_id FROM event_cursors WHERE agent = ? AND org = ?",
        )
        .bind(agent)
        .bind(org)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("last_event_id")))
    }

    /// Commit a cursor position. The upsert refuses to move backwards,
    /// so replay overlap after a reconnect can never regress the cursor.
    pub async fn commit_cursor(
        &self,
        agent: &str,
        org: &str,
        event_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO event_cursors (agent, org, last_event_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (agent, org) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                updated_at = excluded.updated_at
             WHERE excluded.last_event_id > event_cursors.last_event_id",
        )
        .bind(agent)
        .bind(org)
        .bind(event_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(agent, org, event_id, "committed cursor");
        Ok(())
    }

    // --- sub-agent sessions ---

    pub async fn upsert_sub_agent(&self, record: &SubAgentRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sub_agent_sessions
                (sub_agent_id, parent_session_key, credential_ref, expires_at, status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (sub_agent_id) DO UPDATE SET
                parent_session_key = excluded.parent_session_key,
                credential_ref = excluded.credential_ref,
                expires_at = excluded.expires_at,
                status = excluded.status",
        )
        .bind(&record.sub_agent_id)
        .bind(&record.parent_session_key)
        .bind(&record.credential_ref)
        .bind(record.expires_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sub_agent(
        &self,
        sub_agent_id: &str,
    ) -> Result<Option<SubAgentRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT sub_agent_id, parent_session_key, credential_ref, expires_at, status
             FROM sub_agent_sessions WHERE sub_agent_id = ?",
        )
        .bind(sub_agent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::sub_agent_from_row).transpose()
    }

    pub async fn set_sub_agent_status(
        &self,
        sub_agent_id: &str,
        status: SubAgentStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sub_agent_sessions SET status = ? WHERE sub_agent_id = ?")
            .bind(status.as_str())
            .bind(sub_agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn sub_agents_with_status(
        &self,
        status: SubAgentStatus,
    ) -> Result<Vec<SubAgentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT sub_agent_id, parent_session_key, credential_ref, expires_at, status
             FROM sub_agent_sessions WHERE status = ?",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::sub_agent_from_row).collect()
    }

    /// Shutdown path: active sessions become detached (not destroyed) so
    /// they resume on restart. Returns the number detached.
    pub async fn detach_active_sub_agents(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sub_agent_sessions SET status = 'detached' WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Startup path: detached sessions become active again.
    pub async fn reactivate_detached_sub_agents(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sub_agent_sessions SET status = 'active' WHERE status = 'detached'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn sub_agent_from_row(row: sqlx::sqlite::SqliteRow) -> Result<SubAgentRecord, StoreError> {
        let status: String = row.try_get("status")?;
        Ok(SubAgentRecord {
            sub_agent_id: row.try_get("sub_agent_id")?,
            parent_session_key: row.try_get("parent_session_key")?,
            credential_ref: row.try_get("credential_ref")?,
            expires_at: row.try_get("expires_at")?,
            status: status.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapping(agent: &str, channel: &str) -> SessionRecord {
        SessionRecord {
            session_key: format!("{agent}/acme/channel/{channel}"),
            agent: agent.to_string(),
            org: "acme".to_string(),
            channel_id: channel.to_string(),
            channel_kind: "channel".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mapping_round_trip() {
        let store = StateStore::open_in_memory().await.unwrap();

        let record = mapping("marvin", "ch_general");
        store.upsert_mapping(&record).await.unwrap();

        let loaded = store
            .get_mapping("marvin", "ch_general")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.session_key, record.session_key);
        assert_eq!(loaded.channel_kind, "channel");
    }

    #[tokio::test]
    async fn at_most_one_mapping_per_agent_channel() {
        let store = StateStore::open_in_memory().await.unwrap();

        let first = mapping("marvin", "ch_general");
        store.upsert_mapping(&first).await.unwrap();

        // A second insert for the same (agent, channel) is ignored.
        let mut second = mapping("marvin", "ch_general");
        second.session_key = "marvin/acme/channel/other-key".to_string();
        store.upsert_mapping(&second).await.unwrap();

        let loaded = store
            .get_mapping("marvin", "ch_general")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.session_key, first.session_key);

        let all = store.mappings_for_agent("marvin").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_mapping_is_idempotent() {
        let store = StateStore::open_in_memory().await.unwrap();

        let record = mapping("marvin", "ch_general");
        store.upsert_mapping(&record).await.unwrap();
        store.delete_mapping(&record.session_key).await.unwrap();
        assert!(store
            .get_mapping("marvin", "ch_general")
            .await
            .unwrap()
            .is_none());

        // Deleting again is not an error.
        store.delete_mapping(&record.session_key).await.unwrap();
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = StateStore::open_in_memory().await.unwrap();

        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), None);

        store.commit_cursor("marvin", "acme", 100).await.unwrap();
        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), Some(100));

        store.commit_cursor("marvin", "acme", 50).await.unwrap();
        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), Some(100));

        store.commit_cursor("marvin", "acme", 200).await.unwrap();
        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), Some(200));
    }

    #[tokio::test]
    async fn cursors_are_scoped_per_agent_and_org() {
        let store = StateStore::open_in_memory().await.unwrap();

        store.commit_cursor("marvin", "acme", 10).await.unwrap();
        store.commit_cursor("marvin", "globex", 7).await.unwrap();
        store.commit_cursor("bender", "acme", 3).await.unwrap();

        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), Some(10));
        assert_eq!(store.cursor("marvin", "globex").await.unwrap(), Some(7));
        assert_eq!(store.cursor("bender", "acme").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = StateStore::open(&path).await.unwrap();
            store.commit_cursor("marvin", "acme", 42).await.unwrap();
        }

        let store = StateStore::open(&path).await.unwrap();
        assert_eq!(store.cursor("marvin", "acme").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn sub_agent_lifecycle_transitions() {
        let store = StateStore::open_in_memory().await.unwrap();

        let record = SubAgentRecord {
            sub_agent_id: "sub_1".to_string(),
            parent_session_key: "marvin/acme/channel/ch_general".to_string(),
            credential_ref: "SUB_1_TOKEN".to_string(),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            status: SubAgentStatus::Active,
        };
        store.upsert_sub_agent(&record).await.unwrap();

        // Shutdown: active -> detached.
        assert_eq!(store.detach_active_sub_agents().await.unwrap(), 1);
        let loaded = store.get_sub_agent("sub_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SubAgentStatus::Detached);

        // Restart: detached -> active.
        assert_eq!(store.reactivate_detached_sub_agents().await.unwrap(), 1);
        let loaded = store.get_sub_agent("sub_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SubAgentStatus::Active);

        // Termination is final and not touched by detach/reactivate.
        store
            .set_sub_agent_status("sub_1", SubAgentStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(store.detach_active_sub_agents().await.unwrap(), 0);
        assert_eq!(store.reactivate_detached_sub_agents().await.unwrap(), 0);
        let loaded = store.get_sub_agent("sub_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SubAgentStatus::Terminated);
    }

    #[tokio::test]
    async fn sub_agents_filtered_by_status() {
        let store = StateStore::open_in_memory().await.unwrap();

        for (id, status) in [
            ("sub_a", SubAgentStatus::Active),
            ("sub_b", SubAgentStatus::Active),
            ("sub_c", SubAgentStatus::Terminated),
        ] {
            store
                .upsert_sub_agent(&SubAgentRecord {
                    sub_agent_id: id.to_string(),
                    parent_session_key: "marvin/acme/task/t".to_string(),
                    credential_ref: format!("{}_TOKEN", id.to_uppercase()),
                    expires_at: None,
                    status,
                })
                .await
                .unwrap();
        }

        let active = store
            .sub_agents_with_status(SubAgentStatus::Active)
            .await
            .unwrap();
        assert_eq!(active.len(), 2);

        let terminated = store
            .sub_agents_with_status(SubAgentStatus::Terminated)
            .await
            .unwrap();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].sub_agent_id, "sub_c");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            // The stored cursor always equals the running maximum of the
            // committed values, regardless of commit order.
            #[test]
            fn cursor_equals_running_maximum(
                commits in prop::collection::vec(0i64..10_000, 1..40)
            ) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async {
                    let store = StateStore::open_in_memory().await.unwrap();
                    let mut max_seen = i64::MIN;

                    for id in commits {
                        store.commit_cursor("marvin", "acme", id).await.unwrap();
                        max_seen = max_seen.max(id);
                        let stored = store.cursor("marvin", "acme").await.unwrap();
                        prop_assert_eq!(stored, Some(max_seen));
                    }
                    Ok(())
                })?;
            }
        }
    }
}
