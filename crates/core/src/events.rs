//! Event types broadcast by the engine.
//!
//! Listeners subscribe to a channel per category instead of overriding
//! per-event methods; each event is a tagged variant carrying a snapshot
//! of the task it concerns.

use crate::error::TaskError;

/// Lifecycle events for individual tasks.
#[derive(Debug, Clone)]
pub enum TaskEvent<T> {
    /// The task was admitted to the queue.
    Added(T),
    /// A worker began executing the task.
    Started(T),
    /// Progress report from a running task.
    Progress {
        /// Snapshot of the reporting task.
        task: T,
        /// Percent complete, 0-100.
        percent: u8,
    },
    /// The task completed successfully.
    Succeeded(T),
    /// The task failed with the given error.
    Failed {
        /// Snapshot of the failed task.
        task: T,
        /// The recorded failure.
        error: TaskError,
    },
    /// The task was cancelled and its record removed.
    Canceled(T),
    /// An explicit retry was requested for the task.
    Retrying(T),
}

impl<T> TaskEvent<T> {
    /// The task snapshot the event carries.
    pub fn task(&self) -> &T {
        match self {
            TaskEvent::Added(task)
            | TaskEvent::Started(task)
            | TaskEvent::Progress { task, .. }
            | TaskEvent::Succeeded(task)
            | TaskEvent::Failed { task, .. }
            | TaskEvent::Canceled(task)
            | TaskEvent::Retrying(task) => task,
        }
    }
}

/// Queue-wide events, consumed by the host lifecycle wrapper among others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The caller paused the whole queue.
    AllTasksPaused,
    /// The caller resumed the queue and eligible tasks were redispatched.
    AllTasksResumed,
    /// A task just completed and no runnable work remains.
    AllTasksFinished,
    /// No runnable work remains (reached without a fresh completion); the
    /// host wrapper may let the process die.
    KillSignal,
    /// Run-conditions were lost, or a dispatch was suppressed because the
    /// queue is suspended. In-flight work was interrupted but records
    /// remain.
    ConditionsLost,
    /// Run-conditions returned and eligible tasks were redispatched.
    ConditionsReturned,
}
