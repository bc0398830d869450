//! Transient execution context injected into a task for a single run.
//!
//! Only the durable record (id, state, error, created-at, task payload)
//! crosses the persistence boundary. Everything a task needs while it is
//! actually running, like the signal channel back to the engine and the
//! cancellation flag, lives here and is rebuilt for every dispatch.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::TaskError;

/// A state-change signal emitted by a running task.
///
/// Each variant carries a snapshot of the task so the engine can persist
/// the new state without sharing mutable access with the worker.
#[derive(Debug, Clone)]
pub enum TaskSignal<T> {
    /// The worker began executing the task.
    Started(T),
    /// The task mutated durable state mid-run and wants it persisted.
    StateChanged(T),
    /// Progress report. Advisory, never persisted.
    Progress {
        /// Snapshot of the reporting task.
        task: T,
        /// Percent complete, 0-100.
        percent: u8,
    },
    /// The run finished successfully.
    Completed(T),
    /// The run failed with the given error payload.
    Failed {
        /// Snapshot of the failed task.
        task: T,
        /// The failure being recorded.
        error: TaskError,
    },
}

/// Cooperative cancellation flag shared between the engine and a worker.
///
/// The engine also aborts the worker outright; this flag exists so that
/// blocking sections can poll for interruption at defined points and so a
/// cancelled task knows not to re-persist.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Create a fresh, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the flag cancelled and wake any waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a cancel between the check and
            // the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-run execution context handed to [`Task::execute`](crate::Task::execute).
pub struct TaskContext<T> {
    signals: mpsc::UnboundedSender<TaskSignal<T>>,
    cancel: CancelFlag,
    is_retry: bool,
    auto_retry_limit: u32,
    retries_used: AtomicU32,
    terminal_signalled: AtomicBool,
}

impl<T> TaskContext<T> {
    /// Build a context for one run. Constructed by the engine before each
    /// dispatch; task implementations never create one.
    pub fn new(
        signals: mpsc::UnboundedSender<TaskSignal<T>>,
        cancel: CancelFlag,
        is_retry: bool,
        auto_retry_limit: u32,
    ) -> Self {
        Self {
            signals,
            cancel,
            is_retry,
            auto_retry_limit,
            retries_used: AtomicU32::new(0),
            terminal_signalled: AtomicBool::new(false),
        }
    }

    /// Whether this run is a resume/retry rather than a first execution.
    /// Tasks that made partial progress can pick up where they left off.
    pub fn is_retry(&self) -> bool {
        self.is_retry
    }

    /// Whether the engine has requested cancellation of this run.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once the engine requests cancellation.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Consume one slot of the per-process automatic retry budget.
    ///
    /// Returns true while budget remains; a task hitting a transient
    /// failure may loop on this before surfacing an error. The counter is
    /// transient and resets whenever the task is rebuilt.
    pub fn auto_retry(&self) -> bool {
        self.retries_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.auto_retry_limit).then_some(used + 1)
            })
            .is_ok()
    }

    /// How many automatic retries this run has consumed so far.
    pub fn retries_used(&self) -> u32 {
        self.retries_used.load(Ordering::SeqCst)
    }

    /// Send a signal to the engine. Used by the default helpers on
    /// [`Task`](crate::Task); a dropped engine makes this a no-op.
    pub fn send(&self, signal: TaskSignal<T>) {
        if matches!(
            signal,
            TaskSignal::Completed(_) | TaskSignal::Failed { .. }
        ) {
            self.terminal_signalled.store(true, Ordering::SeqCst);
        }
        let _ = self.signals.send(signal);
    }

    /// Whether a terminal (completed/failed) signal has been sent during
    /// this run. Exactly one is required per run; the engine logs a
    /// violation when a run ends without one.
    pub fn terminal_signalled(&self) -> bool {
        self.terminal_signalled.load(Ordering::SeqCst)
    }
}
