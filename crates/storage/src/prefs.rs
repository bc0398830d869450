//! Persisted engine preferences.
//!
//! A tiny key/value table in the same database as the task records, so
//! queue-wide settings (paused, concurrency limit) survive restarts along
//! with the tasks they govern.

use sqlx::sqlite::SqlitePool;

use crate::trait_::Result;

const KEY_PAUSED: &str = "is_paused";
const KEY_MAX_ACTIVE: &str = "max_active_tasks";

/// Key/value preferences sharing the task database.
#[derive(Debug, Clone)]
pub struct PrefsStore {
    pool: SqlitePool,
}

impl PrefsStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM prefs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO prefs (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether the queue was paused when the process last ran.
    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.get(KEY_PAUSED).await?.as_deref() == Some("true"))
    }

    /// Persist the paused flag.
    pub async fn set_paused(&self, paused: bool) -> Result<()> {
        self.set(KEY_PAUSED, if paused { "true" } else { "false" })
            .await
    }

    /// The persisted concurrency limit, if one was ever set.
    pub async fn max_active_tasks(&self) -> Result<Option<usize>> {
        Ok(self
            .get(KEY_MAX_ACTIVE)
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// Persist the concurrency limit.
    pub async fn set_max_active_tasks(&self, max: usize) -> Result<()> {
        self.set(KEY_MAX_ACTIVE, &max.to_string()).await
    }
}
