//! Task identifiers.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a task.
///
/// Ids are supplied by the caller and must be unique within a queue
/// instance for the entire lifetime of the task. Violating uniqueness is
/// a caller error; the engine rejects duplicate ids at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a TaskId from a caller-supplied string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh unique TaskId, for callers that have no natural
    /// identity for their work.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty. Empty ids are rejected at admission.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
