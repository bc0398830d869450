//! Write-through task cache.
//!
//! All reads are served from an in-memory map; every mutation updates the
//! map synchronously and enqueues the matching database write onto a
//! single writer task. One writer means disk writes apply in exactly the
//! order the mutations happened, so after a crash the store holds a
//! consistent (if slightly stale) prefix of the queue's history.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use conveyor_core::{Task, TaskId};

use crate::record::{TaskPatch, TaskRow};
use crate::trait_::{Result, StorageError, TaskStore};

/// Errors admitting a task into the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A task with the same id is already cached.
    #[error("a task with id {0} already exists")]
    Duplicate(TaskId),

    /// The task could not be encoded for storage. Nothing was mutated.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Resolves once the insert behind it has been written to disk (or has
/// failed to). The in-memory admission already happened either way.
#[derive(Debug)]
pub struct PersistTicket {
    ack: oneshot::Receiver<Result<()>>,
}

impl PersistTicket {
    /// Wait for the durable write to land.
    pub async fn wait(self) -> Result<()> {
        match self.ack.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::WriterClosed),
        }
    }
}

enum WriteOp {
    Insert {
        row: TaskRow,
        ack: oneshot::Sender<Result<()>>,
    },
    Upsert(TaskPatch),
    Remove(TaskId),
    RemoveAll,
    Flush(oneshot::Sender<()>),
}

/// In-memory map of live tasks backed by a [`TaskStore`].
#[derive(Debug)]
pub struct TaskCache<T: Task> {
    tasks: Arc<RwLock<HashMap<TaskId, T>>>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl<T: Task> Clone for TaskCache<T> {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
            writes: self.writes.clone(),
        }
    }
}

impl<T: Task> TaskCache<T> {
    /// Load every stored record into memory and start the writer.
    ///
    /// Records whose payload no longer decodes (a task type changed shape
    /// incompatibly) are skipped with a warning rather than failing the
    /// whole load.
    pub async fn load(store: Arc<dyn TaskStore>) -> Result<Self> {
        let rows = store.scan(None).await?;
        let mut tasks = HashMap::with_capacity(rows.len());
        for row in rows {
            match row.decode::<T>() {
                Ok(task) => {
                    tasks.insert(row.id.clone(), task);
                }
                Err(err) => {
                    warn!(task_id = %row.id, %err, "skipping undecodable task record");
                }
            }
        }
        debug!(count = tasks.len(), "task cache loaded");

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(store, rx));

        Ok(Self {
            tasks: Arc::new(RwLock::new(tasks)),
            writes,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, T>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, T>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new task. Fails without mutating anything if the id is
    /// already present or the task cannot be encoded; on success memory
    /// is updated immediately and the returned ticket reports when the
    /// durable insert lands.
    pub fn insert(&self, task: T) -> std::result::Result<PersistTicket, CacheError> {
        let row = TaskRow::from_task(&task)?;

        {
            let mut tasks = self.write();
            if tasks.contains_key(task.id()) {
                return Err(CacheError::Duplicate(task.id().clone()));
            }
            tasks.insert(task.id().clone(), task);
        }

        let (ack, ticket) = oneshot::channel();
        if self.writes.send(WriteOp::Insert { row, ack }).is_err() {
            error!("task write queue is closed, insert not persisted");
        }
        Ok(PersistTicket { ack: ticket })
    }

    /// Replace the cached task and enqueue the matching durable update.
    /// An unencodable snapshot still updates memory; the disk write is
    /// skipped with an error log.
    pub fn upsert(&self, task: &T) {
        self.write().insert(task.id().clone(), task.clone());
        match TaskPatch::from_task(task) {
            Ok(patch) => {
                let _ = self.writes.send(WriteOp::Upsert(patch));
            }
            Err(err) => {
                error!(task_id = %task.id(), %err, "task snapshot not persistable");
            }
        }
    }

    /// Drop the task from memory and enqueue the durable delete.
    pub fn remove(&self, id: &TaskId) -> Option<T> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            let _ = self.writes.send(WriteOp::Remove(id.clone()));
        }
        removed
    }

    /// Drop every task and enqueue the durable wipe.
    pub fn remove_all(&self) {
        self.write().clear();
        let _ = self.writes.send(WriteOp::RemoveAll);
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &TaskId) -> Option<T> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every cached task, keyed by id.
    pub fn get_all(&self) -> HashMap<TaskId, T> {
        self.read().clone()
    }

    /// Whether a task with this id is cached.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.read().contains_key(id)
    }

    /// Number of cached tasks.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Tasks eligible for dispatch, oldest first.
    pub fn tasks_to_run(&self) -> Vec<T> {
        let mut tasks: Vec<T> = self
            .read()
            .values()
            .filter(|task| task.should_run())
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at());
        tasks
    }

    /// Every cached task ordered oldest first.
    pub fn tasks_by_date(&self) -> Vec<T> {
        let mut tasks: Vec<T> = self.read().values().cloned().collect();
        tasks.sort_by_key(|task| task.created_at());
        tasks
    }

    /// Every cached task ordered newest first.
    pub fn tasks_by_date_reverse(&self) -> Vec<T> {
        let mut tasks = self.tasks_by_date();
        tasks.reverse();
        tasks
    }

    /// Resolve once every write enqueued before this call has been
    /// applied to the store.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writes.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(store: Arc<dyn TaskStore>, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Insert { row, ack } => {
                let result = store.insert(&row).await.map(|_| ());
                if let Err(err) = &result {
                    error!(task_id = %row.id, %err, "task insert failed");
                }
                let _ = ack.send(result);
            }
            WriteOp::Upsert(patch) => {
                if let Err(err) = store.upsert(&patch).await {
                    error!(task_id = %patch.id, %err, "task update failed");
                }
            }
            WriteOp::Remove(id) => {
                if let Err(err) = store.remove(&id).await {
                    error!(task_id = %id, %err, "task delete failed");
                }
            }
            WriteOp::RemoveAll => {
                if let Err(err) = store.remove_all().await {
                    error!(%err, "task wipe failed");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("task write queue drained, writer stopping");
}
