//! Row-level representations of persisted tasks.

use conveyor_core::{Task, TaskId, TaskState};

use crate::trait_::{Result, StorageError};

/// One persisted task record, exactly as stored.
///
/// The payload is the full task serialized to JSON; `state` and
/// `created_at` are lifted into their own columns so the store can filter
/// and order without decoding payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRow {
    /// Unique task id, the primary key.
    pub id: TaskId,
    /// Lifecycle state, mirrored from the payload.
    pub state: TaskState,
    /// Full task payload as JSON.
    pub payload: String,
    /// Creation timestamp in epoch milliseconds.
    pub created_at: i64,
}

impl TaskRow {
    /// Encode a task into its stored form.
    pub fn from_task<T: Task>(task: &T) -> Result<Self> {
        Ok(Self {
            id: task.id().clone(),
            state: task.state(),
            payload: serde_json::to_string(task).map_err(StorageError::Encode)?,
            created_at: task.created_at(),
        })
    }

    /// Decode the stored payload back into a task.
    pub fn decode<T: Task>(&self) -> Result<T> {
        serde_json::from_str(&self.payload).map_err(StorageError::Decode)
    }
}

/// A partial update for one task record.
///
/// `None` fields keep the value already on disk; if no record exists yet
/// the update falls back to an insert with defaults for the missing
/// fields. This keeps the merge explicit instead of burying it in SQL.
#[derive(Debug, Clone)]
pub struct TaskPatch {
    /// Id of the record to update.
    pub id: TaskId,
    /// New lifecycle state, if changing.
    pub state: Option<TaskState>,
    /// New payload, if changing.
    pub payload: Option<String>,
    /// New creation timestamp, if changing. Normally never patched.
    pub created_at: Option<i64>,
}

impl TaskPatch {
    /// A full-record patch built from a task snapshot.
    pub fn from_task<T: Task>(task: &T) -> Result<Self> {
        let row = TaskRow::from_task(task)?;
        Ok(Self {
            id: row.id,
            state: Some(row.state),
            payload: Some(row.payload),
            created_at: Some(row.created_at),
        })
    }

    /// A patch that only moves the record's state column.
    pub fn state_only(id: TaskId, state: TaskState) -> Self {
        Self {
            id,
            state: Some(state),
            payload: None,
            created_at: None,
        }
    }
}
