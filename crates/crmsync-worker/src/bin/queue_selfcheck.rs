//! Smoke-checks the batch engine end to end against the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crmsync_models::WorkItem;
use crmsync_queue::MemoryStore;
use crmsync_worker::{BatchEngine, TaskHandler, TaskOutcome, WorkerConfig};

struct EchoHandler {
    completed: AtomicU32,
}

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, item: WorkItem) -> TaskOutcome {
        info!(action = %item.action, "Selfcheck item");
        self.completed.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::Complete
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("crmsync=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    println!("queue-selfcheck: starting");

    let handler = Arc::new(EchoHandler {
        completed: AtomicU32::new(0),
    });
    let engine = BatchEngine::new(
        Arc::new(MemoryStore::new()),
        handler.clone(),
        WorkerConfig::new("selfcheck"),
    );

    let saved = engine
        .enqueue()
        .push(WorkItem::new("ping").with_arg("one"))
        .push(WorkItem::new("ping").with_arg("two"))
        .push(WorkItem::new("ping").with_arg("three"))
        .save()
        .await?
        .ok_or_else(|| anyhow::anyhow!("selfcheck batch was not saved"))?;

    engine.run_cycle().await?;

    let completed = handler.completed.load(Ordering::SeqCst);
    if completed != saved.total {
        return Err(anyhow::anyhow!(
            "expected {} items processed, got {}",
            saved.total,
            completed
        ));
    }
    if !engine.keys().await?.is_empty() {
        return Err(anyhow::anyhow!("queue not drained after selfcheck cycle"));
    }

    if std::env::var("REDIS_URL").is_err() {
        warn!("REDIS_URL is not set; the Redis backend will not be reachable");
    }

    println!("queue-selfcheck: ok");
    Ok(())
}
