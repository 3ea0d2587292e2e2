//! In-process store backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crmsync_models::{Batch, BatchKey, BatchStatus, DeadLetter, WorkItem};

use crate::error::{QueueError, QueueResult};
use crate::store::{BatchStore, LockLease, DEFAULT_MAX_PAYLOAD_BYTES};

/// In-memory [`BatchStore`] for tests and embedded single-process use.
///
/// Honors the same contract as the Redis backend, including payload-size
/// enforcement and lock lease semantics.
pub struct MemoryStore {
    max_payload_bytes: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// All live batches in insertion order, identifiers mixed
    batches: Vec<Batch>,
    statuses: HashMap<BatchKey, BatchStatus>,
    cancels: HashSet<BatchKey>,
    locks: HashMap<String, HeldLock>,
    dead: HashMap<String, Vec<DeadLetter>>,
}

struct HeldLock {
    token: String,
    expires_at: Instant,
}

impl HeldLock {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Override the serialized payload cap.
    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn save(&self, identifier: &str, items: Vec<WorkItem>) -> QueueResult<Batch> {
        if items.is_empty() {
            return Err(QueueError::EmptyBatch);
        }

        let batch = Batch::new(BatchKey::generate(identifier), items);
        let size = serde_json::to_vec(&batch)?.len();
        if size > self.max_payload_bytes {
            return Err(QueueError::BatchTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }

        self.inner().batches.push(batch.clone());
        Ok(batch)
    }

    async fn first_batch(&self, identifier: &str) -> QueueResult<Option<Batch>> {
        let inner = self.inner();
        Ok(inner
            .batches
            .iter()
            .find(|b| b.key.identifier() == identifier)
            .cloned())
    }

    async fn update(&self, key: &BatchKey, items: Vec<WorkItem>) -> QueueResult<()> {
        let mut inner = self.inner();
        match inner.batches.iter_mut().find(|b| &b.key == key) {
            Some(batch) => {
                batch.items = items;
                Ok(())
            }
            None => Err(QueueError::not_found(key.as_str())),
        }
    }

    async fn delete(&self, key: &BatchKey) -> QueueResult<()> {
        let mut inner = self.inner();
        inner.batches.retain(|b| &b.key != key);
        inner.statuses.remove(key);
        inner.cancels.remove(key);
        Ok(())
    }

    async fn keys(&self, identifier: &str) -> QueueResult<Vec<BatchKey>> {
        let inner = self.inner();
        Ok(inner
            .batches
            .iter()
            .filter(|b| b.key.identifier() == identifier)
            .map(|b| b.key.clone())
            .collect())
    }

    async fn is_empty(&self, identifier: &str) -> QueueResult<bool> {
        let inner = self.inner();
        Ok(!inner
            .batches
            .iter()
            .any(|b| b.key.identifier() == identifier))
    }

    async fn write_status(&self, status: &BatchStatus) -> QueueResult<()> {
        self.inner()
            .statuses
            .insert(status.key.clone(), status.clone());
        Ok(())
    }

    async fn read_status(&self, key: &BatchKey) -> QueueResult<Option<BatchStatus>> {
        Ok(self.inner().statuses.get(key).cloned())
    }

    async fn request_cancel(&self, key: &BatchKey) -> QueueResult<()> {
        self.inner().cancels.insert(key.clone());
        Ok(())
    }

    async fn is_cancel_requested(&self, key: &BatchKey) -> QueueResult<bool> {
        Ok(self.inner().cancels.contains(key))
    }

    async fn clear_cancel(&self, key: &BatchKey) -> QueueResult<()> {
        self.inner().cancels.remove(key);
        Ok(())
    }

    async fn try_lock(&self, identifier: &str, ttl: Duration) -> QueueResult<Option<LockLease>> {
        let mut inner = self.inner();
        if inner
            .locks
            .get(identifier)
            .is_some_and(|held| held.is_live())
        {
            return Ok(None);
        }

        let lease = LockLease::new();
        inner.locks.insert(
            identifier.to_string(),
            HeldLock {
                token: lease.token().to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(Some(lease))
    }

    async fn renew_lock(
        &self,
        identifier: &str,
        lease: &LockLease,
        ttl: Duration,
    ) -> QueueResult<bool> {
        let mut inner = self.inner();
        match inner.locks.get_mut(identifier) {
            Some(held) if held.is_live() && held.token == lease.token() => {
                held.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, identifier: &str, lease: &LockLease) -> QueueResult<bool> {
        let mut inner = self.inner();
        match inner.locks.get(identifier) {
            Some(held) if held.is_live() && held.token == lease.token() => {
                inner.locks.remove(identifier);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, identifier: &str) -> QueueResult<bool> {
        Ok(self
            .inner()
            .locks
            .get(identifier)
            .is_some_and(|held| held.is_live()))
    }

    async fn push_dead_letter(&self, identifier: &str, dead: &DeadLetter) -> QueueResult<()> {
        self.inner()
            .dead
            .entry(identifier.to_string())
            .or_default()
            .push(dead.clone());
        Ok(())
    }

    async fn dead_letter_len(&self, identifier: &str) -> QueueResult<u64> {
        Ok(self
            .inner()
            .dead
            .get(identifier)
            .map(|d| d.len() as u64)
            .unwrap_or(0))
    }
}
