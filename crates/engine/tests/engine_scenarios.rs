//! End-to-end scenarios driving a real engine over a real (mostly
//! in-memory) SQLite store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use conveyor_core::{
    codes, EngineEvent, Task, TaskBase, TaskContext, TaskError, TaskEvent, TaskId, TaskState,
};
use conveyor_engine::{AddTaskError, EngineBuilder, ManualConditions, TaskEngine};
use conveyor_storage::SqliteTaskStore;

static RUNNING: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Behavior {
    /// Complete after an optional delay.
    Succeed { delay_ms: u64 },
    /// Fail immediately with an out-of-space error.
    Fail,
    /// Hang on the first run, complete when resumed.
    SucceedOnRetry,
    /// Hang until cancelled.
    Hang,
    /// Record the peak number of concurrent runs, then complete.
    TrackPeak { delay_ms: u64 },
    /// Persist a checkpoint mid-run, fail the first run, complete resumes.
    Checkpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestTask {
    #[serde(flatten)]
    base: TaskBase,
    behavior: Behavior,
    #[serde(default)]
    checkpoints: u32,
}

impl TestTask {
    fn new(id: &str, behavior: Behavior) -> Self {
        Self {
            base: TaskBase::new(id),
            behavior,
            checkpoints: 0,
        }
    }
}

#[async_trait]
impl Task for TestTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    async fn execute(&mut self, ctx: &TaskContext<Self>) {
        match self.behavior {
            Behavior::Succeed { delay_ms } => {
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                self.complete(ctx);
            }
            Behavior::Fail => {
                self.fail(
                    ctx,
                    TaskError::new("test", codes::OUT_OF_SPACE, "disk full"),
                );
            }
            Behavior::SucceedOnRetry => {
                if ctx.is_retry() {
                    self.complete(ctx);
                } else {
                    ctx.cancelled().await;
                }
            }
            Behavior::Hang => {
                ctx.cancelled().await;
            }
            Behavior::TrackPeak { delay_ms } => {
                let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(delay_ms)).await;
                RUNNING.fetch_sub(1, Ordering::SeqCst);
                self.complete(ctx);
            }
            Behavior::Checkpoint => {
                self.checkpoints += 1;
                self.state_changed(ctx);
                if ctx.is_retry() {
                    self.complete(ctx);
                } else {
                    self.fail(ctx, TaskError::generic("first run fails"));
                }
            }
        }
    }
}

async fn ephemeral(name: &str) -> TaskEngine<TestTask> {
    EngineBuilder::new(name).build().await.unwrap()
}

async fn next_task_event(
    rx: &mut broadcast::Receiver<TaskEvent<TestTask>>,
) -> TaskEvent<TestTask> {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for task event")
        .expect("task event channel closed")
}

async fn next_engine_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for engine event")
        .expect("engine event channel closed")
}

/// Wait for a specific engine event, skipping unrelated ones that may
/// interleave (e.g. a fast task finishing while a resume is announced).
async fn wait_for_engine_event(rx: &mut broadcast::Receiver<EngineEvent>, expected: EngineEvent) {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("engine event channel closed");
            if event == expected {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for engine event");
}

async fn assert_no_task_event(rx: &mut broadcast::Receiver<TaskEvent<TestTask>>) {
    let got = timeout(Duration::from_millis(150), rx.recv()).await;
    assert!(got.is_err(), "unexpected event: {:?}", got.unwrap());
}

async fn wait_for_state(engine: &TaskEngine<TestTask>, id: &TaskId, state: TaskState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if engine.get_task(id).map(|t| t.state()) == Some(state) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never reached the expected state");
}

#[tokio::test]
async fn add_runs_to_completion() {
    let engine = ephemeral("happy-path").await;
    let mut tasks = engine.subscribe_task_events();
    let mut events = engine.subscribe_engine_events();

    let task = TestTask::new("t1", Behavior::Succeed { delay_ms: 0 });
    let ticket = engine.add_task(task).unwrap();
    ticket.wait().await.unwrap();

    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));
    match next_task_event(&mut tasks).await {
        TaskEvent::Succeeded(task) => assert_eq!(task.state(), TaskState::Complete),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(
        next_engine_event(&mut events).await,
        EngineEvent::AllTasksFinished
    );

    let stored = engine.get_task(&TaskId::new("t1")).unwrap();
    assert_eq!(stored.state(), TaskState::Complete);
    assert!(!engine.tasks_remaining());
}

#[tokio::test]
async fn duplicate_and_empty_ids_are_rejected() {
    let engine = ephemeral("admission").await;

    engine
        .add_task(TestTask::new("dup", Behavior::Succeed { delay_ms: 0 }))
        .unwrap();
    let again = engine.add_task(TestTask::new("dup", Behavior::Fail));
    assert!(matches!(again, Err(AddTaskError::Duplicate(_))));

    let empty = engine.add_task(TestTask::new("", Behavior::Fail));
    assert!(matches!(empty, Err(AddTaskError::EmptyId)));

    assert_eq!(engine.task_count(), 1);
}

#[tokio::test]
async fn failure_keeps_the_record_with_its_error() {
    let engine = ephemeral("failure").await;
    let mut tasks = engine.subscribe_task_events();
    let mut events = engine.subscribe_engine_events();

    engine.add_task(TestTask::new("t1", Behavior::Fail)).unwrap();

    loop {
        match next_task_event(&mut tasks).await {
            TaskEvent::Failed { task, error } => {
                assert_eq!(task.state(), TaskState::Error);
                assert_eq!(error.code, codes::OUT_OF_SPACE);
                break;
            }
            TaskEvent::Added(_) | TaskEvent::Started(_) => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    // A failure that empties the runnable set quiesces the queue without
    // claiming a completion.
    assert_eq!(next_engine_event(&mut events).await, EngineEvent::KillSignal);

    let stored = engine.get_task(&TaskId::new("t1")).unwrap();
    assert_eq!(stored.state(), TaskState::Error);
    assert_eq!(stored.error().unwrap().message, "disk full");
    assert!(!engine.tasks_remaining());
}

#[tokio::test]
async fn cancel_interrupts_and_forgets_the_task() {
    let engine = ephemeral("cancel-one").await;
    let mut tasks = engine.subscribe_task_events();

    let id = TaskId::new("t1");
    engine.add_task(TestTask::new("t1", Behavior::Hang)).unwrap();
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));
    assert!(engine.is_in_flight(&id));

    engine.cancel_task(&id);

    assert!(matches!(
        next_task_event(&mut tasks).await,
        TaskEvent::Canceled(_)
    ));
    assert!(!engine.is_in_flight(&id));
    assert!(engine.get_task(&id).is_none());
    assert_eq!(engine.task_count(), 0);
}

#[tokio::test]
async fn cancel_all_broadcasts_each_task_then_quiesces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let engine: TaskEngine<TestTask> = EngineBuilder::new("cancel-all")
        .with_database(&path)
        .with_max_active_tasks(2)
        .build()
        .await
        .unwrap();
    let mut tasks = engine.subscribe_task_events();
    let mut events = engine.subscribe_engine_events();

    engine.add_task(TestTask::new("a", Behavior::Hang)).unwrap();
    engine.add_task(TestTask::new("b", Behavior::Hang)).unwrap();
    let mut started = 0;
    while started < 2 {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)) {
            started += 1;
        }
    }

    engine.cancel_all();

    let mut canceled = 0;
    while canceled < 2 {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Canceled(_)) {
            canceled += 1;
        }
    }
    assert_eq!(next_engine_event(&mut events).await, EngineEvent::KillSignal);
    assert_eq!(engine.task_count(), 0);

    // The deletions reach the backing store, not just the cache.
    engine.flush().await;
    use conveyor_storage::TaskStore;
    let store = SqliteTaskStore::open(&path).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn explicit_retry_resumes_a_failed_task() {
    let engine = ephemeral("retry").await;
    let mut tasks = engine.subscribe_task_events();

    let id = TaskId::new("t1");
    engine
        .add_task(TestTask::new("t1", Behavior::Checkpoint))
        .unwrap();
    loop {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Failed { .. }) {
            break;
        }
    }

    engine.retry_task(&id);

    // The retry announcement precedes the new run.
    assert!(matches!(
        next_task_event(&mut tasks).await,
        TaskEvent::Retrying(_)
    ));
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));
    match next_task_event(&mut tasks).await {
        TaskEvent::Succeeded(task) => assert_eq!(task.checkpoints, 2),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(
        engine.get_task(&id).unwrap().state(),
        TaskState::Complete
    );
}

#[tokio::test]
async fn retrying_an_unknown_id_is_a_noop() {
    let engine = ephemeral("retry-unknown").await;
    let mut tasks = engine.subscribe_task_events();

    engine.retry_task(&TaskId::new("ghost"));

    assert_no_task_event(&mut tasks).await;
    assert_eq!(engine.task_count(), 0);
}

#[tokio::test]
async fn retry_all_failed_revives_every_errored_task() {
    let engine = ephemeral("retry-all").await;
    let mut tasks = engine.subscribe_task_events();

    engine.add_task(TestTask::new("a", Behavior::Checkpoint)).unwrap();
    engine.add_task(TestTask::new("b", Behavior::Checkpoint)).unwrap();
    let mut failed = 0;
    while failed < 2 {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Failed { .. }) {
            failed += 1;
        }
    }

    engine.retry_all_failed();

    let mut succeeded = 0;
    while succeeded < 2 {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Succeeded(_)) {
            succeeded += 1;
        }
    }
    assert!(!engine.tasks_remaining());
}

#[tokio::test]
async fn resume_is_a_noop_while_work_is_in_flight() {
    let engine = ephemeral("idempotent-resume").await;
    let mut tasks = engine.subscribe_task_events();

    let id = TaskId::new("t1");
    engine.add_task(TestTask::new("t1", Behavior::Hang)).unwrap();
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));

    // The running task must not be restarted.
    engine.resume_all_if_necessary();
    engine.resume_all_if_necessary();

    assert_no_task_event(&mut tasks).await;
    assert!(engine.is_in_flight(&id));
}

#[tokio::test]
async fn pause_queues_work_and_resume_dispatches_it() {
    let engine = ephemeral("pause").await;
    let mut events = engine.subscribe_engine_events();

    engine.pause_all().await.unwrap();
    assert!(engine.is_paused());
    assert_eq!(
        next_engine_event(&mut events).await,
        EngineEvent::AllTasksPaused
    );

    let mut tasks = engine.subscribe_task_events();
    engine
        .add_task(TestTask::new("t1", Behavior::Succeed { delay_ms: 0 }))
        .unwrap();
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    // Queued but never handed to a worker; the closed gate announces the
    // suppression.
    assert_eq!(
        next_engine_event(&mut events).await,
        EngineEvent::ConditionsLost
    );
    assert_no_task_event(&mut tasks).await;
    assert_eq!(engine.task_count(), 1);

    engine.resume().await.unwrap();
    wait_for_engine_event(&mut events, EngineEvent::AllTasksResumed).await;
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));
    assert!(matches!(
        next_task_event(&mut tasks).await,
        TaskEvent::Succeeded(_)
    ));
}

#[tokio::test]
async fn pause_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    {
        let engine: TaskEngine<TestTask> = EngineBuilder::new("restart-paused")
            .with_database(&path)
            .build()
            .await
            .unwrap();
        engine.pause_all().await.unwrap();
    }

    let engine: TaskEngine<TestTask> = EngineBuilder::new("restart-paused")
        .with_database(&path)
        .build()
        .await
        .unwrap();
    assert!(engine.is_paused());

    let mut tasks = engine.subscribe_task_events();
    engine
        .add_task(TestTask::new("t1", Behavior::Succeed { delay_ms: 0 }))
        .unwrap();
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    assert_no_task_event(&mut tasks).await;
}

#[tokio::test]
async fn lost_conditions_interrupt_and_returned_conditions_resume() {
    let conditions = Arc::new(ManualConditions::new(true));
    let engine: TaskEngine<TestTask> = EngineBuilder::new("conditions")
        .with_conditions(conditions.clone())
        .build()
        .await
        .unwrap();
    let mut tasks = engine.subscribe_task_events();
    let mut events = engine.subscribe_engine_events();

    let id = TaskId::new("t1");
    engine
        .add_task(TestTask::new("t1", Behavior::SucceedOnRetry))
        .unwrap();
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Added(_)));
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));

    conditions.set(false);
    assert_eq!(
        next_engine_event(&mut events).await,
        EngineEvent::ConditionsLost
    );
    // The record is untouched and still eligible.
    assert_eq!(engine.get_task(&id).unwrap().state(), TaskState::Ready);
    assert!(engine.tasks_remaining());

    conditions.set(true);
    wait_for_engine_event(&mut events, EngineEvent::ConditionsReturned).await;
    assert!(matches!(next_task_event(&mut tasks).await, TaskEvent::Started(_)));
    assert!(matches!(
        next_task_event(&mut tasks).await,
        TaskEvent::Succeeded(_)
    ));
}

#[tokio::test]
async fn restart_redispatches_ready_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    // A READY record left behind by a previous process.
    {
        use conveyor_storage::{TaskRow, TaskStore};
        let store = SqliteTaskStore::open(&path).await.unwrap();
        let task = TestTask::new("t1", Behavior::Succeed { delay_ms: 0 });
        store.insert(&TaskRow::from_task(&task).unwrap()).await.unwrap();
    }

    let engine: TaskEngine<TestTask> = EngineBuilder::new("restart")
        .with_database(&path)
        .build()
        .await
        .unwrap();

    wait_for_state(&engine, &TaskId::new("t1"), TaskState::Complete).await;
}

#[tokio::test]
async fn serial_execution_runs_one_task_at_a_time() {
    let engine: TaskEngine<TestTask> = EngineBuilder::new("serial")
        .with_serial_execution()
        .build()
        .await
        .unwrap();
    let mut tasks = engine.subscribe_task_events();

    for id in ["a", "b", "c"] {
        engine
            .add_task(TestTask::new(id, Behavior::TrackPeak { delay_ms: 30 }))
            .unwrap();
    }

    let mut succeeded = 0;
    while succeeded < 3 {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Succeeded(_)) {
            succeeded += 1;
        }
    }
    assert_eq!(PEAK.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn midrun_checkpoints_reach_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let engine: TaskEngine<TestTask> = EngineBuilder::new("checkpoint")
        .with_database(&path)
        .build()
        .await
        .unwrap();
    let mut tasks = engine.subscribe_task_events();

    let id = TaskId::new("t1");
    engine
        .add_task(TestTask::new("t1", Behavior::Checkpoint))
        .unwrap();
    loop {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Failed { .. }) {
            break;
        }
    }
    engine.flush().await;

    let store = SqliteTaskStore::open(&path).await.unwrap();
    let row = read_row(&store, &id).await;
    assert_eq!(row.state, TaskState::Error);
    let stored: TestTask = row.decode().unwrap();
    assert_eq!(stored.checkpoints, 1);

    engine.retry_task(&id);
    loop {
        if matches!(next_task_event(&mut tasks).await, TaskEvent::Succeeded(_)) {
            break;
        }
    }
    engine.flush().await;

    let row = read_row(&store, &id).await;
    assert_eq!(row.state, TaskState::Complete);
    let stored: TestTask = row.decode().unwrap();
    assert_eq!(stored.checkpoints, 2);
}

async fn read_row(store: &SqliteTaskStore, id: &TaskId) -> conveyor_storage::TaskRow {
    use conveyor_storage::TaskStore;
    store
        .scan(None)
        .await
        .unwrap()
        .into_iter()
        .find(|row| &row.id == id)
        .expect("record not found")
}
