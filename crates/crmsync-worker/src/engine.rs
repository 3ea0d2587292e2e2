//! Batch engine: worker cycles, dispatch, and healthcheck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crmsync_models::{Batch, BatchKey, BatchStatus, DeadLetter, MemoryBudget};
use crmsync_queue::{BatchStore, PendingBatch};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::{
    record_batch_cancelled, record_batch_completed, record_cycle, record_item_completed,
    record_item_dead_lettered, record_item_retried, set_queue_depth,
};
use crate::resource::MemoryProbe;
use crate::task::{TaskHandler, TaskOutcome};

/// Backoff after a failed worker cycle before the loop resumes.
const CYCLE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Result of a dispatch request. Both variants are success-equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A wake-up was delivered (or one was already pending).
    Triggered,
    /// A worker cycle is already running; nothing to do.
    AlreadyRunning,
}

/// Why an iterating cycle stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    TimeExceeded,
    MemoryExceeded,
    Cancelled,
}

/// Durable batch processor for one queue identifier.
///
/// Work arrives through [`enqueue`](Self::enqueue) + [`dispatch`](Self::dispatch),
/// is processed by [`run_cycle`](Self::run_cycle) under an exclusive lock
/// lease, and the long-running [`run`](Self::run) loop ties the wake channel
/// and the periodic healthcheck together.
pub struct BatchEngine {
    store: Arc<dyn BatchStore>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    budget: MemoryBudget,
    probe: MemoryProbe,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    healthcheck_armed: AtomicBool,
}

impl BatchEngine {
    /// Create a new engine.
    pub fn new(
        store: Arc<dyn BatchStore>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let budget = MemoryBudget::from_declared(
            config.memory_limit.as_deref(),
            config.memory_threshold_percent,
        );

        Self {
            store,
            handler,
            config,
            budget,
            probe: MemoryProbe::new(),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            healthcheck_armed: AtomicBool::new(false),
        }
    }

    /// Start collecting items for a new batch.
    pub fn enqueue(&self) -> PendingBatch {
        PendingBatch::new(self.store.clone(), &self.config.identifier)
    }

    /// Trigger out-of-band processing.
    ///
    /// A no-op reporting [`DispatchOutcome::AlreadyRunning`] while a cycle
    /// holds the lock; a full wake channel also counts as triggered, since a
    /// wake-up is already pending.
    pub async fn dispatch(&self) -> WorkerResult<DispatchOutcome> {
        if self.store.is_locked(&self.config.identifier).await? {
            debug!("Dispatch skipped, a worker cycle is already running");
            return Ok(DispatchOutcome::AlreadyRunning);
        }

        self.healthcheck_armed.store(true, Ordering::SeqCst);
        let _ = self.wake_tx.try_send(());
        Ok(DispatchOutcome::Triggered)
    }

    /// Ask the running (or next-triggered) worker to discard a batch.
    pub async fn cancel(&self, key: &BatchKey) -> WorkerResult<()> {
        info!(key = %key, "Cancel requested");
        Ok(self.store.request_cancel(key).await?)
    }

    /// Progress snapshot for a batch, if one exists.
    pub async fn status(&self, key: &BatchKey) -> WorkerResult<Option<BatchStatus>> {
        Ok(self.store.read_status(key).await?)
    }

    /// Live batch keys, oldest first.
    pub async fn keys(&self) -> WorkerResult<Vec<BatchKey>> {
        Ok(self.store.keys(&self.config.identifier).await?)
    }

    /// Whether a worker cycle currently holds the lock.
    pub async fn is_processing(&self) -> WorkerResult<bool> {
        Ok(self.store.is_locked(&self.config.identifier).await?)
    }

    /// Items dead-lettered for this queue so far.
    pub async fn dead_letter_len(&self) -> WorkerResult<u64> {
        Ok(self.store.dead_letter_len(&self.config.identifier).await?)
    }

    /// Run the engine loop until `shutdown` flips to `true`.
    ///
    /// Selects over the wake channel and the healthcheck ticker; an in-flight
    /// cycle always finishes before shutdown completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let mut wake_rx = match self.wake_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or(WorkerError::AlreadyRunning)?;

        info!(
            identifier = %self.config.identifier,
            healthcheck_interval = ?self.config.healthcheck_interval,
            "Starting batch engine"
        );

        let mut ticker = tokio::time::interval(self.config.healthcheck_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, stopping engine");
                        break;
                    }
                }
                received = wake_rx.recv() => {
                    match received {
                        Some(()) => {
                            if let Err(e) = self.run_cycle().await {
                                error!("Worker cycle failed: {}", e);
                                tokio::time::sleep(CYCLE_ERROR_BACKOFF).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.healthcheck().await {
                        error!("Healthcheck failed: {}", e);
                    }
                }
            }
        }

        // Hand the receiver back so the engine can be run again.
        match self.wake_rx.lock() {
            Ok(mut guard) => *guard = Some(wake_rx),
            Err(poisoned) => *poisoned.into_inner() = Some(wake_rx),
        }

        info!("Batch engine stopped");
        Ok(())
    }

    /// Periodic self-healing trigger.
    ///
    /// Recovers a queue whose wake-up was lost (e.g. the process crashed
    /// between save and cycle). If the queue is empty it stands down until
    /// the next dispatch re-arms it; if a worker is running it does nothing;
    /// otherwise it runs a cycle.
    pub async fn healthcheck(&self) -> WorkerResult<()> {
        if !self.config.healthcheck_always_on && !self.healthcheck_armed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let identifier = self.config.identifier.as_str();
        if self.store.is_locked(identifier).await? {
            debug!("Healthcheck: a worker cycle is already running");
            return Ok(());
        }

        if self.store.is_empty(identifier).await? {
            if !self.config.healthcheck_always_on {
                self.healthcheck_armed.store(false, Ordering::SeqCst);
            }
            return Ok(());
        }

        info!(identifier, "Healthcheck found queued work with no running worker");
        self.run_cycle().await
    }

    /// Run one worker cycle: lock, iterate batches oldest-first within the
    /// time/memory budget, write back or delete, unlock, and hand off.
    pub async fn run_cycle(&self) -> WorkerResult<()> {
        let identifier = self.config.identifier.as_str();
        let lock_ttl = self.config.lock_ttl();

        let Some(lease) = self.store.try_lock(identifier, lock_ttl).await? else {
            debug!(identifier, "Cycle skipped, another worker holds the lock");
            return Ok(());
        };
        record_cycle();

        let started = Instant::now();
        let mut last_renewal = started;
        let mut cancelled_keys: Vec<BatchKey> = Vec::new();
        let mut cycle_cancelled = false;
        let mut lease_lost = false;

        'cycle: loop {
            let Some(mut batch) = self.store.first_batch(identifier).await? else {
                break;
            };

            // A cancel may have landed while this batch sat in the queue.
            if self.store.is_cancel_requested(&batch.key).await? {
                self.discard_batch(&batch).await?;
                cancelled_keys.push(batch.key.clone());
                cycle_cancelled = true;
                break;
            }

            let mut status = self
                .store
                .read_status(&batch.key)
                .await?
                .unwrap_or_else(|| BatchStatus::new(&batch));
            status.begin_cycle();

            let mut stop: Option<StopReason> = None;
            let mut idx = 0;
            while idx < batch.items.len() {
                if last_renewal.elapsed() >= lock_ttl / 2 {
                    if !self.store.renew_lock(identifier, &lease, lock_ttl).await? {
                        warn!(
                            identifier,
                            key = %batch.key,
                            "Lock lease lost mid-cycle, abandoning without write-back"
                        );
                        lease_lost = true;
                        break 'cycle;
                    }
                    last_renewal = Instant::now();
                }

                let item = batch.items[idx].clone();
                let action = item.action.clone();
                let attempts = item.attempts;

                status.begin_step(&action, batch.remaining());
                self.persist_status(&status).await;

                let step_started = Instant::now();
                let outcome = self.handler.run(item).await;
                let elapsed = step_started.elapsed();

                match outcome {
                    TaskOutcome::Complete => {
                        batch.items.remove(idx);
                        status.finish_step(&action, elapsed, batch.remaining(), self.memory_percent());
                        self.persist_status(&status).await;
                        record_item_completed();
                    }
                    TaskOutcome::Retry(mut next) => {
                        next.attempts = attempts + 1;
                        match self.config.max_item_attempts {
                            Some(cap) if next.attempts >= cap => {
                                warn!(
                                    key = %batch.key,
                                    action = %action,
                                    attempts = next.attempts,
                                    "Item exhausted its retry budget, dead-lettering"
                                );
                                let dead = DeadLetter::new(
                                    batch.key.clone(),
                                    next,
                                    format!("retry budget exhausted after {} attempts", cap),
                                );
                                self.store.push_dead_letter(identifier, &dead).await?;
                                batch.items.remove(idx);
                                record_item_dead_lettered();
                            }
                            _ => {
                                batch.items[idx] = next;
                                idx += 1;
                                record_item_retried();
                            }
                        }
                    }
                }

                stop = self.exit_guard(started, &batch.key).await?;
                if stop.is_some() {
                    break;
                }
            }

            if stop == Some(StopReason::Cancelled) {
                self.discard_batch(&batch).await?;
                cancelled_keys.push(batch.key.clone());
                cycle_cancelled = true;
                break 'cycle;
            }

            if batch.is_empty() {
                self.store.delete(&batch.key).await?;
                info!(key = %batch.key, total = batch.total, "Batch complete");
                record_batch_completed();
            } else {
                self.store.update(&batch.key, batch.items.clone()).await?;
            }

            if let Some(reason) = stop {
                debug!(key = %batch.key, ?reason, elapsed = ?started.elapsed(), "Cycle yielding");
                break 'cycle;
            }
            // No guard tripped: fetch the next batch, or re-pass over this
            // one while retried items remain.
        }

        if !lease_lost && !self.store.unlock(identifier, &lease).await? {
            warn!(identifier, "Lock lease had already expired at unlock");
        }

        for key in &cancelled_keys {
            self.handler.on_cancelled(key).await;
        }

        if lease_lost || cycle_cancelled {
            return Ok(());
        }

        let remaining = self.store.keys(identifier).await?.len();
        set_queue_depth(remaining);

        if remaining > 0 {
            // Budget yield with work left over: hand off to the next cycle.
            let _ = self.wake_tx.try_send(());
        } else {
            self.handler.on_complete().await;
            self.healthcheck_armed.store(false, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Evaluate the three per-item exit conditions.
    async fn exit_guard(
        &self,
        started: Instant,
        key: &BatchKey,
    ) -> WorkerResult<Option<StopReason>> {
        if started.elapsed() >= self.config.time_limit {
            return Ok(Some(StopReason::TimeExceeded));
        }

        let rss = self.probe.rss_bytes();
        if rss > 0 && self.budget.is_exceeded(rss) {
            return Ok(Some(StopReason::MemoryExceeded));
        }

        if self.store.is_cancel_requested(key).await? {
            return Ok(Some(StopReason::Cancelled));
        }

        Ok(None)
    }

    async fn discard_batch(&self, batch: &Batch) -> WorkerResult<()> {
        info!(
            key = %batch.key,
            remaining = batch.remaining(),
            "Batch cancelled, discarding remaining items"
        );
        self.store.delete(&batch.key).await?;
        record_batch_cancelled();
        Ok(())
    }

    /// Status snapshots are a side channel; a write failure is logged, not
    /// allowed to kill the cycle.
    async fn persist_status(&self, status: &BatchStatus) {
        if let Err(e) = self.store.write_status(status).await {
            warn!(key = %status.key, "Failed to write status snapshot: {}", e);
        }
    }

    fn memory_percent(&self) -> f32 {
        let rss = self.probe.rss_bytes();
        if rss == 0 {
            return 0.0;
        }
        self.budget.percent_used(rss)
    }
}
