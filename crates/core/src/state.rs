//! Task state machine.

use serde::{Deserialize, Serialize};

/// The persisted lifecycle state shared by every task type.
///
/// Only state that needs to survive a restart lives here; transient state
/// (progress, retry counters, cancellation) is carried by the execution
/// context instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Ready to be executed (unless the task adds stricter preconditions
    /// in `should_run`). The initial state, re-entered after a retry
    /// clears an error.
    Ready,

    /// Finished execution successfully. Terminal.
    Complete,

    /// Encountered an error and needs an explicit retry. The task's error
    /// payload is populated when in this state.
    Error,
}

impl TaskState {
    /// Stable string form, used as the `state` column in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Complete => "COMPLETE",
            TaskState::Error => "ERROR",
        }
    }

    /// Parse the stored string form back into a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(TaskState::Ready),
            "COMPLETE" => Some(TaskState::Complete),
            "ERROR" => Some(TaskState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
