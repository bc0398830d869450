//! Engine configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use conveyor_core::Task;
use conveyor_storage::{SqliteTaskStore, TaskCache, TaskStore};

use crate::conditions::{AlwaysMet, Conditions};
use crate::engine::{EngineError, TaskEngine};

const DEFAULT_MAX_ACTIVE: usize = 3;
const DEFAULT_AUTO_RETRY_LIMIT: u32 = 3;

/// Configures and builds a [`TaskEngine`].
///
/// ```no_run
/// # use conveyor_engine::{EngineBuilder, TaskEngine};
/// # async fn build<T: conveyor_core::Task>() -> Result<TaskEngine<T>, conveyor_engine::EngineError> {
/// EngineBuilder::new("downloads")
///     .with_database("downloads.db")
///     .with_max_active_tasks(2)
///     .build()
///     .await
/// # }
/// ```
pub struct EngineBuilder {
    name: String,
    db_path: Option<PathBuf>,
    conditions: Arc<dyn Conditions>,
    max_active_tasks: usize,
    auto_retry_limit: u32,
}

impl EngineBuilder {
    /// Start a builder for a queue with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_path: None,
            conditions: Arc::new(AlwaysMet::new()),
            max_active_tasks: DEFAULT_MAX_ACTIVE,
            auto_retry_limit: DEFAULT_AUTO_RETRY_LIMIT,
        }
    }

    /// Persist task records to the given SQLite file. Without this the
    /// engine runs on an in-memory database and nothing survives the
    /// process.
    pub fn with_database(mut self, path: impl AsRef<Path>) -> Self {
        self.db_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Gate dispatch on the given run-conditions.
    pub fn with_conditions(mut self, conditions: Arc<dyn Conditions>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Limit how many tasks execute concurrently (minimum 1, default 3).
    /// A limit persisted by a previous run takes precedence.
    pub fn with_max_active_tasks(mut self, max: usize) -> Self {
        self.max_active_tasks = max.max(1);
        self
    }

    /// Run tasks one at a time.
    pub fn with_serial_execution(self) -> Self {
        self.with_max_active_tasks(1)
    }

    /// Budget of in-run automatic retries handed to each dispatch
    /// (default 3). Transient, unlike explicit retries.
    pub fn with_auto_retry_limit(mut self, limit: u32) -> Self {
        self.auto_retry_limit = limit;
        self
    }

    /// Open the store, load the cache, start the engine, and dispatch
    /// whatever is already eligible.
    pub async fn build<T: Task>(self) -> Result<TaskEngine<T>, EngineError> {
        let store = match &self.db_path {
            Some(path) => SqliteTaskStore::open(path).await?,
            None => SqliteTaskStore::in_memory().await?,
        };
        let prefs = store.prefs();
        let paused = prefs.is_paused().await?;
        let max_active = prefs
            .max_active_tasks()
            .await?
            .unwrap_or(self.max_active_tasks)
            .max(1);

        let cache: TaskCache<T> = TaskCache::load(Arc::new(store) as Arc<dyn TaskStore>).await?;

        info!(
            queue = %self.name,
            tasks = cache.len(),
            max_active,
            paused,
            "task engine starting"
        );

        let engine = TaskEngine::from_parts(
            self.name,
            cache,
            prefs,
            self.conditions,
            max_active,
            paused,
            self.auto_retry_limit,
        );
        engine.resume_all_if_necessary();
        Ok(engine)
    }
}
