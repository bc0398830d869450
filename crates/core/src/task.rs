//! The task contract - the unit of work the engine schedules and persists.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::{TaskContext, TaskSignal};
use crate::error::TaskError;
use crate::id::TaskId;
use crate::state::TaskState;

/// The durable fields every task type carries.
///
/// Concrete task types embed this with `#[serde(flatten)]` so the shared
/// fields serialize at the top level of the payload, next to the type's
/// own fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBase {
    /// Unique identifier, caller-supplied.
    pub id: TaskId,

    /// Current lifecycle state. Defaults to [`TaskState::Ready`].
    pub state: TaskState,

    /// Error payload, populated when the state is [`TaskState::Error`].
    /// Not cleared when the task leaves the error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,

    /// Unix timestamp in milliseconds of first construction. Immutable,
    /// used for ordering.
    pub created_at: i64,
}

impl TaskBase {
    /// Create the durable base for a brand new task.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            state: TaskState::Ready,
            error: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A self-contained unit of work with identity, persisted lifecycle state,
/// and an overridable execution routine.
///
/// Implementations provide [`execute`](Task::execute) and expose their
/// embedded [`TaskBase`]; everything else has sensible defaults. A run
/// must signal exactly one of [`complete`](Task::complete) /
/// [`fail`](Task::fail) - the engine does not infer success from a normal
/// return, and a run that signals neither is a defect in the task type.
///
/// Tasks only ever mutate themselves on their own worker; the engine sees
/// state through the snapshots attached to signals.
#[async_trait]
pub trait Task: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The embedded durable fields.
    fn base(&self) -> &TaskBase;

    /// Mutable access to the embedded durable fields.
    fn base_mut(&mut self) -> &mut TaskBase;

    /// The primary run routine. Runs on a worker; must tolerate an abrupt
    /// cancellation mid-I/O without corrupting persisted state, and must
    /// itself signal completion or failure.
    async fn execute(&mut self, ctx: &TaskContext<Self>);

    /// Run routine for resumes. Defaults to re-running [`execute`];
    /// override to continue from partial progress instead of restarting.
    async fn retry(&mut self, ctx: &TaskContext<Self>) {
        self.execute(ctx).await;
    }

    /// Whether the engine may dispatch this task. The base condition is
    /// "state is Ready"; override to add stricter preconditions. Must be
    /// side-effect free.
    fn should_run(&self) -> bool {
        self.state() == TaskState::Ready
    }

    /// The task's unique id.
    fn id(&self) -> &TaskId {
        &self.base().id
    }

    /// Current lifecycle state.
    fn state(&self) -> TaskState {
        self.base().state
    }

    /// The last recorded error payload, if any. Only meaningful while the
    /// state is [`TaskState::Error`].
    fn error(&self) -> Option<&TaskError> {
        self.base().error.as_ref()
    }

    /// Creation timestamp in epoch milliseconds.
    fn created_at(&self) -> i64 {
        self.base().created_at
    }

    /// Signal that this run finished successfully. Call exactly once per
    /// run, from `execute`/`retry`.
    fn complete(&mut self, ctx: &TaskContext<Self>) {
        self.base_mut().state = TaskState::Complete;
        ctx.send(TaskSignal::Completed(self.clone()));
    }

    /// Signal that this run failed. Call exactly once per run, from
    /// `execute`/`retry`.
    fn fail(&mut self, ctx: &TaskContext<Self>, error: TaskError) {
        let base = self.base_mut();
        base.state = TaskState::Error;
        base.error = Some(error.clone());
        ctx.send(TaskSignal::Failed {
            task: self.clone(),
            error,
        });
    }

    /// Report progress (0-100). Advisory and never persisted.
    fn report_progress(&self, ctx: &TaskContext<Self>, percent: u8) {
        ctx.send(TaskSignal::Progress {
            task: self.clone(),
            percent: percent.min(100),
        });
    }

    /// Ask the engine to persist durable state mutated mid-run (for
    /// example a partial-progress marker a resume will read back).
    fn state_changed(&self, ctx: &TaskContext<Self>) {
        ctx.send(TaskSignal::StateChanged(self.clone()));
    }

    /// Clear the error transition ahead of an explicit retry: moves
    /// `Error` back to `Ready`. The stale error payload is intentionally
    /// left in place. Returns whether a transition happened.
    fn clear_error_for_retry(&mut self) -> bool {
        if self.state() == TaskState::Error {
            self.base_mut().state = TaskState::Ready;
            true
        } else {
            false
        }
    }
}
