//! Conveyor task engine.
//!
//! Drives a persistent queue of one task type: admission with duplicate
//! rejection, bounded-concurrency dispatch, cancellation, explicit
//! retries, queue-wide pause/resume, and run-conditions gating. State
//! survives restarts through the write-through cache in
//! [`conveyor_storage`].

#![warn(missing_docs)]

mod builder;
mod conditions;
mod engine;

pub use builder::EngineBuilder;
pub use conditions::{AlwaysMet, Conditions, ManualConditions};
pub use engine::{AddTaskError, EngineError, TaskEngine};

pub use conveyor_core::{
    CancelFlag, EngineEvent, Task, TaskBase, TaskContext, TaskError, TaskEvent, TaskId, TaskState,
};
pub use conveyor_storage::PersistTicket;
