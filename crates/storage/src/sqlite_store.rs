//! SQLite-backed task store.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use conveyor_core::{TaskId, TaskState};

use crate::prefs::PrefsStore;
use crate::record::{TaskPatch, TaskRow};
use crate::trait_::{Result, TaskStore};

/// Bumped when the `tasks` table shape changes. Records are recoverable
/// work, not user data, so an incompatible file is rebuilt from scratch
/// rather than migrated.
const SCHEMA_VERSION: i64 = 1;

/// Task store persisting records to a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (or create) a database file and prepare the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database, mainly for tests and ephemeral queues.
    pub async fn in_memory() -> Result<Self> {
        // A second connection would see a different empty database, so the
        // pool is pinned to a single long-lived connection.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Preferences store sharing this database.
    pub fn prefs(&self) -> PrefsStore {
        PrefsStore::new(self.pool.clone())
    }

    /// Verify the database responds to queries.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if version != 0 && version != SCHEMA_VERSION {
            warn!(
                found = version,
                expected = SCHEMA_VERSION,
                "incompatible task schema, rebuilding table"
            );
            sqlx::query("DROP TABLE IF EXISTS tasks")
                .execute(&self.pool)
                .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'READY',
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prefs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await?;

        debug!(version = SCHEMA_VERSION, "task schema ready");
        Ok(())
    }

    fn row_from_sqlite(row: &SqliteRow) -> Result<Option<TaskRow>> {
        let id: String = row.try_get("id")?;
        let state: String = row.try_get("state")?;
        let Some(state) = TaskState::parse(&state) else {
            warn!(task_id = %id, state = %state, "skipping record with unknown state");
            return Ok(None);
        };
        Ok(Some(TaskRow {
            id: TaskId::new(id),
            state,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, row: &TaskRow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks (id, state, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(row.id.as_str())
        .bind(row.state.as_str())
        .bind(&row.payload)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert(&self, patch: &TaskPatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT state, payload, created_at FROM tasks WHERE id = ?",
        )
        .bind(patch.id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) => {
                let state = match patch.state {
                    Some(state) => state.as_str().to_string(),
                    None => row.try_get("state")?,
                };
                let payload = match &patch.payload {
                    Some(payload) => payload.clone(),
                    None => row.try_get("payload")?,
                };
                let created_at = match patch.created_at {
                    Some(at) => at,
                    None => row.try_get("created_at")?,
                };
                sqlx::query(
                    "UPDATE tasks SET state = ?, payload = ?, created_at = ? WHERE id = ?",
                )
                .bind(state)
                .bind(payload)
                .bind(created_at)
                .bind(patch.id.as_str())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                let state = patch.state.unwrap_or(TaskState::Ready);
                let payload = patch.payload.clone().unwrap_or_else(|| "{}".to_string());
                let created_at = patch
                    .created_at
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                sqlx::query(
                    "INSERT INTO tasks (id, state, payload, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(patch.id.as_str())
                .bind(state.as_str())
                .bind(payload)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, id: &TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM tasks").execute(&self.pool).await?;
        Ok(())
    }

    async fn scan(&self, state: Option<TaskState>) -> Result<Vec<TaskRow>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT id, state, payload, created_at FROM tasks \
                     WHERE state = ? ORDER BY created_at ASC",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, state, payload, created_at FROM tasks \
                     ORDER BY created_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = Self::row_from_sqlite(row)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
