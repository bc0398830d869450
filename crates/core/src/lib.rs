//! Conveyor core data models.
//!
//! This crate defines the task contract and the shared types that flow
//! between the persistent store, the in-memory cache, and the engine:
//! identifiers, the lifecycle state machine, error payloads, the
//! per-run execution context, and the event types the engine broadcasts.

#![warn(missing_docs)]

// Identity and lifecycle
mod id;
mod state;
mod error;

// Execution contract
mod context;
mod task;

// Engine event surface
mod events;

pub use context::{CancelFlag, TaskContext, TaskSignal};
pub use error::{codes, TaskError};
pub use events::{EngineEvent, TaskEvent};
pub use id::TaskId;
pub use state::TaskState;
pub use task::{Task, TaskBase};
