//! The task engine: admission, dispatch, cancellation, retries, and
//! queue-wide pause/resume.
//!
//! Every task mutation flows through one signal pump so listeners observe
//! events in a single, serial order. Workers never touch shared state
//! directly; they emit snapshots over the signal channel and the pump
//! persists and broadcasts them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::{
    CancelFlag, EngineEvent, Task, TaskContext, TaskError, TaskEvent, TaskId, TaskSignal,
    TaskState,
};
use conveyor_storage::{CacheError, PersistTicket, PrefsStore, StorageError, TaskCache};

use crate::conditions::Conditions;

/// Events kept per subscriber before the oldest are dropped. A lagging
/// subscriber sees a `RecvError::Lagged` rather than blocking the queue.
const EVENT_CAPACITY: usize = 64;

/// Errors admitting a task to the queue.
#[derive(Debug, Error)]
pub enum AddTaskError {
    /// The task id is empty.
    #[error("task id must not be empty")]
    EmptyId,

    /// A task with the same id is already queued.
    #[error("a task with id {0} is already queued")]
    Duplicate(TaskId),

    /// The task payload could not be encoded for storage.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Engine-level failures, all storage-rooted.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The persistence layer failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

struct InFlight {
    handle: JoinHandle<()>,
    cancel: CancelFlag,
    /// Marks which dispatch owns this entry. Signals carry the same
    /// marker, so a run that was interrupted and replaced cannot act on
    /// its successor's entry.
    generation: u64,
}

/// A signal tagged with the dispatch that produced it.
struct RunSignal<T> {
    generation: u64,
    signal: TaskSignal<T>,
}

/// A persistent, crash-resilient task queue for one task type.
///
/// Cloning is cheap and clones drive the same queue. Built via
/// [`EngineBuilder::new`](crate::EngineBuilder::new).
pub struct TaskEngine<T: Task> {
    inner: Arc<Inner<T>>,
}

impl<T: Task> Clone for TaskEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Task> {
    name: String,
    cache: TaskCache<T>,
    prefs: PrefsStore,
    conditions: Arc<dyn Conditions>,
    /// Tasks currently handed to a worker. At most one entry per id.
    ledger: Mutex<HashMap<TaskId, InFlight>>,
    permits: Arc<Semaphore>,
    max_active: AtomicUsize,
    paused: AtomicBool,
    resuming: AtomicBool,
    auto_retry_limit: u32,
    generations: AtomicU64,
    signals: mpsc::UnboundedSender<RunSignal<T>>,
    task_events: broadcast::Sender<TaskEvent<T>>,
    engine_events: broadcast::Sender<EngineEvent>,
}

impl<T: Task> TaskEngine<T> {
    pub(crate) fn from_parts(
        name: String,
        cache: TaskCache<T>,
        prefs: PrefsStore,
        conditions: Arc<dyn Conditions>,
        max_active: usize,
        paused: bool,
        auto_retry_limit: u32,
    ) -> Self {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (task_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (engine_events, _) = broadcast::channel(EVENT_CAPACITY);
        let conditions_rx = conditions.subscribe();

        let inner = Arc::new(Inner {
            name,
            cache,
            prefs,
            conditions,
            ledger: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_active)),
            max_active: AtomicUsize::new(max_active),
            paused: AtomicBool::new(paused),
            resuming: AtomicBool::new(false),
            auto_retry_limit,
            generations: AtomicU64::new(0),
            signals,
            task_events,
            engine_events,
        });

        tokio::spawn(run_pump(Arc::downgrade(&inner), signal_rx));
        tokio::spawn(run_conditions_watcher(Arc::downgrade(&inner), conditions_rx));

        Self { inner }
    }

    /// The queue's name, used in log output.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Admit a new task and dispatch it if the queue is running.
    ///
    /// The task is visible to reads as soon as this returns; the ticket
    /// resolves when the record has actually been written to disk. A
    /// dispatch suppressed by pause or unmet conditions is not an error,
    /// the task simply stays queued.
    pub fn add_task(&self, task: T) -> Result<PersistTicket, AddTaskError> {
        if task.id().is_empty() {
            return Err(AddTaskError::EmptyId);
        }
        let ticket = match self.inner.cache.insert(task.clone()) {
            Ok(ticket) => ticket,
            Err(CacheError::Duplicate(id)) => return Err(AddTaskError::Duplicate(id)),
            Err(CacheError::Storage(err)) => return Err(AddTaskError::Storage(err)),
        };
        debug!(task_id = %task.id(), "task added");
        let _ = self.inner.task_events.send(TaskEvent::Added(task.clone()));
        self.inner.dispatch(task, false);
        Ok(ticket)
    }

    /// Cancel one task: interrupt its run if in flight, delete its record,
    /// and broadcast the cancellation. Unknown ids are a no-op.
    pub fn cancel_task(&self, id: &TaskId) {
        self.inner.cancel(id);
    }

    /// Cancel everything: interrupt all in-flight runs and wipe every
    /// record. Each removed task is broadcast as canceled.
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    /// Explicitly retry one task. In-flight tasks are left alone; a task
    /// in the error state is moved back to ready first. The run resumes
    /// (`is_retry` set) rather than restarting.
    pub fn retry_task(&self, id: &TaskId) {
        self.inner.retry(id);
    }

    /// Retry every task currently in the error state.
    pub fn retry_all_failed(&self) {
        let failed: Vec<TaskId> = self
            .inner
            .cache
            .tasks_by_date()
            .into_iter()
            .filter(|task| task.state() == TaskState::Error)
            .map(|task| task.id().clone())
            .collect();
        info!(count = failed.len(), "retrying failed tasks");
        for id in failed {
            self.inner.retry(&id);
        }
    }

    /// Dispatch all eligible tasks, but only when nothing is in flight.
    /// Called on startup and safe to call repeatedly.
    pub fn resume_all_if_necessary(&self) {
        self.inner.resume_all_if_necessary();
    }

    /// Pause the whole queue: interrupt in-flight runs (records remain)
    /// and suppress dispatch until [`resume`](Self::resume). The flag is
    /// persisted, so a restarted process comes back paused.
    pub async fn pause_all(&self) -> Result<(), EngineError> {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(queue = %self.inner.name, "pausing all tasks");
        self.inner.prefs.set_paused(true).await?;
        self.inner.interrupt_in_flight();
        let _ = self.inner.engine_events.send(EngineEvent::AllTasksPaused);
        Ok(())
    }

    /// Clear the persisted pause and redispatch eligible tasks.
    pub async fn resume(&self) -> Result<(), EngineError> {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(queue = %self.inner.name, "resuming all tasks");
        self.inner.prefs.set_paused(false).await?;
        if self.inner.resume_all() {
            let _ = self.inner.engine_events.send(EngineEvent::AllTasksResumed);
        }
        Ok(())
    }

    /// Feed a conditions change in by hand instead of (or in addition to)
    /// the watch subscription. Idempotent.
    pub fn on_conditions_change(&self, met: bool) {
        self.inner.on_conditions_change(met);
    }

    /// Change the concurrency limit. Takes effect immediately when
    /// raised; when lowered, slots above the new limit drain as running
    /// tasks finish. Persisted across restarts.
    pub async fn set_max_active_tasks(&self, max: usize) -> Result<(), EngineError> {
        let max = max.max(1);
        self.inner.prefs.set_max_active_tasks(max).await?;
        let previous = self.inner.max_active.swap(max, Ordering::SeqCst);
        if max > previous {
            self.inner.permits.add_permits(max - previous);
        } else if max < previous {
            let surplus = (previous - max) as u32;
            let permits = Arc::clone(&self.inner.permits);
            tokio::spawn(async move {
                if let Ok(permit) = permits.acquire_many_owned(surplus).await {
                    permit.forget();
                }
            });
        }
        Ok(())
    }

    /// The current concurrency limit.
    pub fn max_active_tasks(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    /// Whether the queue is paused.
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether run-conditions are currently met.
    pub fn are_conditions_met(&self) -> bool {
        self.inner.conditions.are_met()
    }

    /// Snapshot of one task.
    pub fn get_task(&self, id: &TaskId) -> Option<T> {
        self.inner.cache.get(id)
    }

    /// Snapshot of every queued task, keyed by id.
    pub fn get_tasks(&self) -> HashMap<TaskId, T> {
        self.inner.cache.get_all()
    }

    /// Tasks eligible for dispatch, oldest first.
    pub fn tasks_to_run(&self) -> Vec<T> {
        self.inner.cache.tasks_to_run()
    }

    /// Every queued task, oldest first.
    pub fn tasks_by_date(&self) -> Vec<T> {
        self.inner.cache.tasks_by_date()
    }

    /// Every queued task, newest first.
    pub fn tasks_by_date_reverse(&self) -> Vec<T> {
        self.inner.cache.tasks_by_date_reverse()
    }

    /// Number of queued tasks, in any state.
    pub fn task_count(&self) -> usize {
        self.inner.cache.len()
    }

    /// Whether any task is still eligible to run (including ones
    /// currently executing).
    pub fn tasks_remaining(&self) -> bool {
        !self.inner.cache.tasks_to_run().is_empty()
    }

    /// Whether the task is currently handed to a worker.
    pub fn is_in_flight(&self, id: &TaskId) -> bool {
        self.inner.ledger().contains_key(id)
    }

    /// Subscribe to per-task lifecycle events.
    pub fn subscribe_task_events(&self) -> broadcast::Receiver<TaskEvent<T>> {
        self.inner.task_events.subscribe()
    }

    /// Subscribe to queue-wide events.
    pub fn subscribe_engine_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.engine_events.subscribe()
    }

    /// Wait until every mutation made so far has been written to disk.
    pub async fn flush(&self) {
        self.inner.cache.flush().await;
    }
}

impl<T: Task> Inner<T> {
    fn ledger(&self) -> MutexGuard<'_, HashMap<TaskId, InFlight>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_suspended(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || !self.conditions.are_met()
    }

    /// Hand a task to a worker unless the queue is suspended or the task
    /// is already in flight. The ledger entry is created before the
    /// worker can observe anything, so a given id runs at most once.
    fn dispatch(self: &Arc<Self>, task: T, is_retry: bool) {
        if task.id().is_empty() {
            error!("task with empty id cannot be dispatched");
            return;
        }
        if self.is_suspended() {
            debug!(task_id = %task.id(), "dispatch suppressed while suspended");
            let _ = self.engine_events.send(EngineEvent::ConditionsLost);
            return;
        }

        let id = task.id().clone();
        let mut ledger = self.ledger();
        if ledger.contains_key(&id) {
            debug!(task_id = %id, "task already in flight");
            return;
        }

        debug!(task_id = %id, is_retry, "dispatching task");
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelFlag::new();

        // Each run gets a private channel; a forwarder stamps its signals
        // with the run's generation before they reach the shared pump.
        let (run_tx, mut run_rx) = mpsc::unbounded_channel();
        let pump = self.signals.clone();
        tokio::spawn(async move {
            while let Some(signal) = run_rx.recv().await {
                if pump.send(RunSignal { generation, signal }).is_err() {
                    break;
                }
            }
        });

        let ctx = TaskContext::new(run_tx, cancel.clone(), is_retry, self.auto_retry_limit);
        let handle = tokio::spawn(run_task(
            Arc::clone(&self.permits),
            ctx,
            task,
            is_retry,
        ));
        ledger.insert(
            id,
            InFlight {
                handle,
                cancel,
                generation,
            },
        );
    }

    /// Applied on the pump, one signal at a time. Signals whose run no
    /// longer owns the ledger entry (interrupted and redispatched, or
    /// cancelled outright) are dropped: acting on them would persist an
    /// outdated snapshot or retire the replacement run.
    fn handle_signal(self: &Arc<Self>, run: RunSignal<T>) {
        let RunSignal { generation, signal } = run;
        let id = match &signal {
            TaskSignal::Started(task)
            | TaskSignal::StateChanged(task)
            | TaskSignal::Completed(task) => task.id().clone(),
            TaskSignal::Progress { task, .. } | TaskSignal::Failed { task, .. } => {
                task.id().clone()
            }
        };
        let current = self.ledger().get(&id).map(|entry| entry.generation);
        if current != Some(generation) {
            debug!(task_id = %id, "dropping signal from a superseded run");
            return;
        }

        match signal {
            TaskSignal::Started(task) => {
                let _ = self.task_events.send(TaskEvent::Started(task));
            }
            TaskSignal::StateChanged(task) => {
                debug!(task_id = %task.id(), "persisting mid-run state");
                self.cache.upsert(&task);
            }
            TaskSignal::Progress { task, percent } => {
                let _ = self.task_events.send(TaskEvent::Progress { task, percent });
            }
            TaskSignal::Completed(task) => {
                debug!(task_id = %task.id(), "task completed");
                self.cache.upsert(&task);
                self.retire(task.id(), generation);
                let _ = self.task_events.send(TaskEvent::Succeeded(task));
                self.reconcile(true);
            }
            TaskSignal::Failed { task, error } => {
                warn!(task_id = %task.id(), %error, "task failed");
                self.cache.upsert(&task);
                self.retire(task.id(), generation);
                let _ = self.task_events.send(TaskEvent::Failed { task, error });
                self.reconcile(false);
            }
        }
    }

    /// Drop a finished run from the ledger without aborting it. Only the
    /// run that owns the entry may retire it.
    fn retire(&self, id: &TaskId, generation: u64) {
        let mut ledger = self.ledger();
        if ledger.get(id).map(|entry| entry.generation) == Some(generation) {
            ledger.remove(id);
        }
    }

    /// Redispatch anything eligible, or announce that no work remains.
    /// `after_completion` distinguishes "the last task just finished"
    /// from quiescence reached some other way.
    fn reconcile(self: &Arc<Self>, after_completion: bool) {
        let runnable = self.cache.tasks_to_run();
        if runnable.is_empty() {
            let event = if after_completion {
                EngineEvent::AllTasksFinished
            } else {
                EngineEvent::KillSignal
            };
            debug!(?event, "no runnable work remains");
            let _ = self.engine_events.send(event);
            return;
        }
        if self.is_suspended() {
            return;
        }
        for task in runnable {
            self.dispatch(task, true);
        }
    }

    fn cancel(self: &Arc<Self>, id: &TaskId) {
        debug!(task_id = %id, "cancelling task");
        if let Some(in_flight) = self.ledger().remove(id) {
            in_flight.cancel.cancel();
            in_flight.handle.abort();
        }
        if let Some(task) = self.cache.remove(id) {
            let _ = self.task_events.send(TaskEvent::Canceled(task));
        }
        self.reconcile(false);
    }

    fn cancel_all(self: &Arc<Self>) {
        info!(queue = %self.name, "cancelling all tasks");
        self.interrupt_in_flight();
        let tasks = self.cache.tasks_by_date();
        self.cache.remove_all();
        for task in tasks {
            let _ = self.task_events.send(TaskEvent::Canceled(task));
        }
        self.reconcile(false);
    }

    fn retry(self: &Arc<Self>, id: &TaskId) {
        if self.ledger().contains_key(id) {
            debug!(task_id = %id, "task is in flight, not retrying");
            return;
        }
        let Some(mut task) = self.cache.get(id) else {
            error!(task_id = %id, "attempt to retry a task that does not exist");
            return;
        };
        let _ = self.task_events.send(TaskEvent::Retrying(task.clone()));
        if task.clear_error_for_retry() {
            self.cache.upsert(&task);
        }
        self.dispatch(task, true);
    }

    /// Interrupt every in-flight run. Records are untouched; the tasks
    /// stay eligible and will be redispatched on the next resume.
    fn interrupt_in_flight(&self) {
        let mut ledger = self.ledger();
        for (id, in_flight) in ledger.drain() {
            debug!(task_id = %id, "interrupting in-flight task");
            in_flight.cancel.cancel();
            in_flight.handle.abort();
        }
    }

    /// Interrupt whatever is running and redispatch everything eligible.
    /// Returns false when the queue is suspended or a resume is already
    /// underway.
    fn resume_all(self: &Arc<Self>) -> bool {
        if self.is_suspended() {
            let _ = self.engine_events.send(EngineEvent::ConditionsLost);
            return false;
        }
        if self.resuming.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.interrupt_in_flight();
        for task in self.cache.tasks_to_run() {
            self.dispatch(task, true);
        }
        self.resuming.store(false, Ordering::SeqCst);
        true
    }

    fn resume_all_if_necessary(self: &Arc<Self>) {
        if !self.ledger().is_empty() {
            debug!("tasks already in flight, resume not necessary");
            return;
        }
        self.resume_all();
    }

    fn on_conditions_change(self: &Arc<Self>, met: bool) {
        debug!(met, "run conditions changed");
        if met {
            if self.resume_all() {
                let _ = self.engine_events.send(EngineEvent::ConditionsReturned);
            }
        } else {
            let _ = self.engine_events.send(EngineEvent::ConditionsLost);
            self.interrupt_in_flight();
        }
    }
}

/// One task run on a worker. Holds a concurrency permit for the whole
/// run; the admission ledger entry was created by the dispatcher.
async fn run_task<T: Task>(
    permits: Arc<Semaphore>,
    ctx: TaskContext<T>,
    mut task: T,
    is_retry: bool,
) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    // Cancelled while waiting for a slot.
    if ctx.is_cancelled() {
        return;
    }

    ctx.send(TaskSignal::Started(task.clone()));

    let run = async {
        if is_retry {
            task.retry(&ctx).await
        } else {
            task.execute(&ctx).await
        }
    };
    let outcome = AssertUnwindSafe(run).catch_unwind().await;

    match outcome {
        Ok(()) => {
            if !ctx.terminal_signalled() && !ctx.is_cancelled() {
                warn!(
                    task_id = %task.id(),
                    "task run ended without signalling completion or failure"
                );
            }
        }
        Err(_) => {
            if !ctx.terminal_signalled() {
                error!(task_id = %task.id(), "task panicked during execution");
                task.fail(&ctx, TaskError::generic("task panicked during execution"));
            }
        }
    }
}

async fn run_pump<T: Task>(
    inner: Weak<Inner<T>>,
    mut signals: mpsc::UnboundedReceiver<RunSignal<T>>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(engine) = inner.upgrade() else { break };
        engine.handle_signal(signal);
    }
    debug!("signal pump stopped");
}

async fn run_conditions_watcher<T: Task>(
    inner: Weak<Inner<T>>,
    mut conditions: watch::Receiver<bool>,
) {
    while conditions.changed().await.is_ok() {
        let met = *conditions.borrow_and_update();
        let Some(engine) = inner.upgrade() else { break };
        engine.on_conditions_change(met);
    }
    debug!("conditions watcher stopped");
}
