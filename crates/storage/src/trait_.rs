//! The durable store abstraction.

use async_trait::async_trait;
use conveyor_core::{TaskId, TaskState};
use thiserror::Error;

use crate::record::{TaskPatch, TaskRow};

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A task payload could not be serialized.
    #[error("failed to encode task payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored payload could not be deserialized.
    #[error("failed to decode task payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The write queue shut down before acknowledging the operation.
    #[error("storage write queue is closed")]
    WriterClosed,
}

/// Storage result alias.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable CRUD over task records.
///
/// Implementations must be safe to share across workers; callers get
/// ordering guarantees from [`TaskCache`](crate::TaskCache), not from the
/// store itself.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a brand new record. Returns `false` without touching the
    /// existing row when the id is already present.
    async fn insert(&self, row: &TaskRow) -> Result<bool>;

    /// Apply a partial update, inserting the record if it does not exist.
    /// Fields absent from the patch keep their stored values.
    async fn upsert(&self, patch: &TaskPatch) -> Result<()>;

    /// Delete one record. Deleting a missing id is not an error.
    async fn remove(&self, id: &TaskId) -> Result<()>;

    /// Delete every record.
    async fn remove_all(&self) -> Result<()>;

    /// Read back records, optionally restricted to one state, ordered by
    /// creation time ascending.
    async fn scan(&self, state: Option<TaskState>) -> Result<Vec<TaskRow>>;

    /// Number of stored records.
    async fn count(&self) -> Result<u64>;
}
