//! A small download-style queue: three tasks, one of which fails and is
//! retried, with every event printed as it happens.
//!
//! Run with `cargo run --example download_queue`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conveyor_engine::{
    EngineBuilder, EngineEvent, Task, TaskBase, TaskContext, TaskError, TaskEngine, TaskEvent,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DownloadTask {
    #[serde(flatten)]
    base: TaskBase,
    url: String,
    #[serde(default)]
    bytes_fetched: u64,
}

impl DownloadTask {
    fn new(id: &str, url: &str) -> Self {
        Self {
            base: TaskBase::new(id),
            url: url.to_string(),
            bytes_fetched: 0,
        }
    }
}

#[async_trait]
impl Task for DownloadTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    async fn execute(&mut self, ctx: &TaskContext<Self>) {
        // Pretend to download in four chunks, checkpointing each one so a
        // resume can pick up where this run stopped.
        let total_chunks: u64 = 4;
        let done_chunks = self.bytes_fetched / 256;
        for chunk in done_chunks..total_chunks {
            if ctx.is_cancelled() {
                return;
            }
            sleep(Duration::from_millis(100)).await;

            // The flaky host drops the connection on the first pass.
            if self.url.contains("flaky") && !ctx.is_retry() {
                self.fail(
                    ctx,
                    TaskError::new("downloads", "NETWORK", "connection reset"),
                );
                return;
            }

            self.bytes_fetched += 256;
            self.state_changed(ctx);
            self.report_progress(ctx, ((chunk + 1) * 100 / total_chunks) as u8);
        }
        self.complete(ctx);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine: TaskEngine<DownloadTask> = EngineBuilder::new("downloads")
        .with_database("downloads.db")
        .with_max_active_tasks(2)
        .build()
        .await?;

    let mut task_events = engine.subscribe_task_events();
    let mut engine_events = engine.subscribe_engine_events();

    for (id, url) in [
        ("report", "https://example.com/report.pdf"),
        ("video", "https://example.com/video.mp4"),
        ("backup", "https://flaky.example.com/backup.tar"),
    ] {
        if let Err(err) = engine.add_task(DownloadTask::new(id, url)) {
            info!(%err, "task not admitted");
        }
    }

    let watcher = engine.clone();
    tokio::spawn(async move {
        while let Ok(event) = task_events.recv().await {
            match event {
                TaskEvent::Progress { task, percent } => {
                    info!(id = %task.id(), percent, "downloading");
                }
                TaskEvent::Failed { task, error } => {
                    info!(id = %task.id(), %error, "failed, retrying");
                    watcher.retry_task(task.id());
                }
                TaskEvent::Succeeded(task) => {
                    info!(id = %task.id(), "download complete");
                }
                other => {
                    info!(id = %other.task().id(), "lifecycle event");
                }
            }
        }
    });

    loop {
        match engine_events.recv().await? {
            EngineEvent::AllTasksFinished | EngineEvent::KillSignal => break,
            event => info!(?event, "queue event"),
        }
    }

    engine.flush().await;
    info!(tasks = engine.task_count(), "all downloads settled");
    Ok(())
}
