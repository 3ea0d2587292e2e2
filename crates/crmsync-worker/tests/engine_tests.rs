//! Engine behavior tests over the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crmsync_models::{BatchKey, WorkItem};
use crmsync_queue::{BatchStore, MemoryStore};
use crmsync_worker::{BatchEngine, DispatchOutcome, TaskHandler, TaskOutcome, WorkerConfig};

const IDENT: &str = "crmsync";

fn items(n: usize) -> Vec<WorkItem> {
    (0..n).map(|i| WorkItem::new(format!("step_{i}"))).collect()
}

async fn wait_until_empty(store: &MemoryStore, deadline: Duration) -> bool {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if store.is_empty(IDENT).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Completes every item, counting completions, drains, and cancellations.
#[derive(Default)]
struct CompleteAll {
    completed: AtomicU32,
    drains: AtomicU32,
    cancelled: AtomicU32,
}

#[async_trait]
impl TaskHandler for CompleteAll {
    async fn run(&self, _item: WorkItem) -> TaskOutcome {
        self.completed.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::Complete
    }

    async fn on_complete(&self) {
        self.drains.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_cancelled(&self, _key: &BatchKey) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands every item back unchanged, optionally sleeping first.
struct AlwaysRetry {
    delay: Duration,
    runs: AtomicU32,
}

impl AlwaysRetry {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            runs: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskHandler for AlwaysRetry {
    async fn run(&self, item: WorkItem) -> TaskOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        TaskOutcome::Retry(item)
    }
}

/// Completes items slowly so the cycle budget trips mid-batch.
struct SlowComplete {
    delay: Duration,
    completed: AtomicU32,
}

#[async_trait]
impl TaskHandler for SlowComplete {
    async fn run(&self, _item: WorkItem) -> TaskOutcome {
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::Complete
    }
}

/// Completes the first item, then requests cancellation of its own batch.
struct CancelAfterFirst {
    store: Arc<MemoryStore>,
    completed: AtomicU32,
    cancelled_keys: Mutex<Vec<BatchKey>>,
}

#[async_trait]
impl TaskHandler for CancelAfterFirst {
    async fn run(&self, _item: WorkItem) -> TaskOutcome {
        if self.completed.fetch_add(1, Ordering::SeqCst) == 0 {
            let keys = self.store.keys(IDENT).await.unwrap();
            self.store.request_cancel(&keys[0]).await.unwrap();
        }
        TaskOutcome::Complete
    }

    async fn on_cancelled(&self, key: &BatchKey) {
        self.cancelled_keys.lock().unwrap().push(key.clone());
    }
}

#[tokio::test]
async fn cheap_items_drain_in_one_cycle() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CompleteAll::default());
    let engine = BatchEngine::new(store.clone(), handler.clone(), WorkerConfig::new(IDENT));

    let saved = engine
        .enqueue()
        .push_all(items(15))
        .save()
        .await
        .unwrap()
        .unwrap();

    // Over the threshold, so an initial status record is visible before any
    // worker cycle runs.
    let status = engine.status(&saved.key).await.unwrap().unwrap();
    assert_eq!(status.total, 15);
    assert_eq!(status.remaining, 15);

    engine.run_cycle().await.unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 15);
    assert_eq!(handler.drains.load(Ordering::SeqCst), 1);
    assert!(store.is_empty(IDENT).await.unwrap());
    assert!(engine.status(&saved.key).await.unwrap().is_none());
    assert_eq!(engine.dead_letter_len().await.unwrap(), 0);
    assert!(!engine.is_processing().await.unwrap());
}

#[tokio::test]
async fn time_budget_yields_partial_progress_then_resumes() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(SlowComplete {
        delay: Duration::from_millis(25),
        completed: AtomicU32::new(0),
    });
    let engine = BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT).with_time_limit(Duration::from_millis(60)),
    );

    let saved = engine
        .enqueue()
        .push_all(items(6))
        .save()
        .await
        .unwrap()
        .unwrap();

    engine.run_cycle().await.unwrap();

    let completed = handler.completed.load(Ordering::SeqCst) as usize;
    assert!(completed >= 1, "budget allows at least one item");
    assert!(completed < 6, "budget must trip before the batch drains");

    // The remainder is exactly the unprocessed suffix, in original order.
    let left = store.first_batch(IDENT).await.unwrap().unwrap();
    assert_eq!(left.key, saved.key);
    assert_eq!(left.items.len(), 6 - completed);
    let actions: Vec<&str> = left.items.iter().map(|i| i.action.as_str()).collect();
    let expected: Vec<String> = (completed..6).map(|i| format!("step_{i}")).collect();
    assert_eq!(actions, expected);

    // A later cycle with headroom finishes the job.
    let resumed = BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT).with_time_limit(Duration::from_secs(10)),
    );
    resumed.run_cycle().await.unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 6);
    assert!(store.is_empty(IDENT).await.unwrap());
}

#[tokio::test]
async fn always_retrying_batch_stops_at_the_time_budget() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(AlwaysRetry::new(Duration::from_millis(15)));
    // Cap disabled: this reproduces the legacy unbounded-retry behavior,
    // bounded only by the cycle's wall clock.
    let engine = BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT)
            .with_time_limit(Duration::from_millis(50))
            .with_max_item_attempts(None),
    );

    engine
        .enqueue()
        .push_all(items(3))
        .save()
        .await
        .unwrap()
        .unwrap();

    engine.run_cycle().await.unwrap();

    // No progress, no crash: all three items survive in order.
    let left = store.first_batch(IDENT).await.unwrap().unwrap();
    assert_eq!(left.items.len(), 3);
    let actions: Vec<&str> = left.items.iter().map(|i| i.action.as_str()).collect();
    assert_eq!(actions, ["step_0", "step_1", "step_2"]);
    assert!(handler.runs.load(Ordering::SeqCst) >= 1);
    assert!(left.items[0].attempts >= 1);
    assert_eq!(engine.dead_letter_len().await.unwrap(), 0);
}

#[tokio::test]
async fn retry_cap_dead_letters_exhausted_items() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(AlwaysRetry::new(Duration::ZERO));
    let engine = BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT).with_max_item_attempts(Some(2)),
    );

    engine
        .enqueue()
        .push_all(items(2))
        .save()
        .await
        .unwrap()
        .unwrap();

    engine.run_cycle().await.unwrap();

    // Each item ran twice (attempts 1 then 2), then hit the cap.
    assert_eq!(handler.runs.load(Ordering::SeqCst), 4);
    assert_eq!(engine.dead_letter_len().await.unwrap(), 2);
    assert!(store.is_empty(IDENT).await.unwrap());
}

#[tokio::test]
async fn cancel_before_processing_discards_the_batch() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CompleteAll::default());
    let engine = BatchEngine::new(store.clone(), handler.clone(), WorkerConfig::new(IDENT));

    let saved = engine
        .enqueue()
        .push_all(items(3))
        .save()
        .await
        .unwrap()
        .unwrap();

    engine.cancel(&saved.key).await.unwrap();
    engine.run_cycle().await.unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 0);
    assert_eq!(handler.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(handler.drains.load(Ordering::SeqCst), 0);
    assert!(store.is_empty(IDENT).await.unwrap());
    assert!(engine.status(&saved.key).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_mid_batch_stops_after_the_current_item() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CancelAfterFirst {
        store: store.clone(),
        completed: AtomicU32::new(0),
        cancelled_keys: Mutex::new(Vec::new()),
    });
    let engine = BatchEngine::new(store.clone(), handler.clone(), WorkerConfig::new(IDENT));

    let saved = engine
        .enqueue()
        .push_all(items(3))
        .save()
        .await
        .unwrap()
        .unwrap();

    engine.run_cycle().await.unwrap();

    // The in-flight item finished; the other two were destroyed with the batch.
    assert_eq!(handler.completed.load(Ordering::SeqCst), 1);
    assert_eq!(
        handler.cancelled_keys.lock().unwrap().as_slice(),
        &[saved.key.clone()]
    );
    assert!(store.is_empty(IDENT).await.unwrap());
    assert!(engine.status(&saved.key).await.unwrap().is_none());
}

#[tokio::test]
async fn dispatch_is_a_no_op_while_a_worker_runs() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CompleteAll::default());
    let engine = BatchEngine::new(store.clone(), handler, WorkerConfig::new(IDENT));

    let lease = store
        .try_lock(IDENT, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(engine.dispatch().await.unwrap(), DispatchOutcome::AlreadyRunning);

    store.unlock(IDENT, &lease).await.unwrap();
    assert_eq!(engine.dispatch().await.unwrap(), DispatchOutcome::Triggered);
}

#[tokio::test]
async fn run_loop_processes_dispatched_work_and_shuts_down() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CompleteAll::default());
    let engine = Arc::new(BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    engine
        .enqueue()
        .push_all(items(5))
        .save()
        .await
        .unwrap()
        .unwrap();
    engine.dispatch().await.unwrap();

    assert!(
        wait_until_empty(&store, Duration::from_secs(2)).await,
        "dispatched batch should drain"
    );

    shutdown_tx.send(true).unwrap();
    run_handle.await.unwrap().unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 5);
    assert_eq!(handler.drains.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn healthcheck_recovers_a_queue_with_a_lost_wakeup() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CompleteAll::default());
    let engine = Arc::new(BatchEngine::new(
        store.clone(),
        handler.clone(),
        WorkerConfig::new(IDENT)
            .with_healthcheck_interval(Duration::from_millis(50))
            .with_healthcheck_always_on(true),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    // Save without dispatching, simulating a wake-up lost in flight.
    engine
        .enqueue()
        .push_all(items(4))
        .save()
        .await
        .unwrap()
        .unwrap();

    assert!(
        wait_until_empty(&store, Duration::from_secs(2)).await,
        "healthcheck should pick up the stalled batch"
    );

    shutdown_tx.send(true).unwrap();
    run_handle.await.unwrap().unwrap();

    assert_eq!(handler.completed.load(Ordering::SeqCst), 4);
}
