//! Task error payloads.

use serde::{Deserialize, Serialize};

/// Well-known error codes. Task types are free to use their own codes;
/// these cover the failures the engine and the bundled task types report.
pub mod codes {
    /// Catch-all, also used when a task panics instead of signalling.
    pub const GENERIC: &str = "GENERIC";
    /// A network operation failed.
    pub const NETWORK: &str = "NETWORK";
    /// Local storage is exhausted.
    pub const OUT_OF_SPACE: &str = "OUT_OF_SPACE";
    /// A required resource does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Reserved for task types that can detect allocation failure
    /// themselves; the engine cannot catch an aborting allocator.
    pub const OUT_OF_MEMORY: &str = "OUT_OF_MEMORY";
}

/// The error payload recorded when a task fails.
///
/// Persisted alongside the task. It is not guaranteed to be cleared when
/// the task leaves the `Error` state, so callers must check the state
/// before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// The subsystem the error belongs to, e.g. a manager name.
    pub domain: String,

    /// Machine-readable code, see [`codes`].
    pub code: String,

    /// Human-readable description.
    pub message: String,

    /// Rendered underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TaskError {
    /// Create an error payload.
    pub fn new(
        domain: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach a rendered cause.
    pub fn with_source(mut self, source: impl std::fmt::Display) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// A generic-code error in the engine domain. Used when a task
    /// implementation panics instead of reporting failure.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new("conveyor", codes::GENERIC, message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.domain, self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " (caused by: {source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}
