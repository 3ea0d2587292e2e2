//! Storage contract for persisted batches.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crmsync_models::{Batch, BatchKey, BatchStatus, DeadLetter, WorkItem};

use crate::error::QueueResult;

/// Default cap on a serialized batch payload.
///
/// Mirrors the row-size ceiling of typical key/value backing stores; a batch
/// over the cap is rejected at `save` time with an explicit error instead of
/// being silently dropped.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Ownership token for a held process lock.
///
/// Only the lease that acquired the lock can renew or release it; a lease
/// left to expire is reclaimable by the next `try_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    token: String,
}

impl LockLease {
    pub(crate) fn new() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Durable storage for batches, progress status, locks, cancel flags, and
/// dead letters.
///
/// Batches are returned oldest-first. The worker lock is a lease with an
/// ownership token: acquisition is an atomic check-and-set, so two workers
/// racing for a cycle cannot both win.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Persist `items` as a new batch under a fresh key.
    ///
    /// Rejects empty item lists, and rejects payloads over the backend's
    /// size limit with [`QueueError::BatchTooLarge`](crate::QueueError).
    async fn save(&self, identifier: &str, items: Vec<WorkItem>) -> QueueResult<Batch>;

    /// Earliest-inserted live batch for the identifier, if any.
    async fn first_batch(&self, identifier: &str) -> QueueResult<Option<Batch>>;

    /// Overwrite a batch's remaining items.
    async fn update(&self, key: &BatchKey, items: Vec<WorkItem>) -> QueueResult<()>;

    /// Remove a batch together with its status record and cancel flag.
    async fn delete(&self, key: &BatchKey) -> QueueResult<()>;

    /// Live batch keys for the identifier, oldest first.
    async fn keys(&self, identifier: &str) -> QueueResult<Vec<BatchKey>>;

    /// Whether no batches remain for the identifier.
    async fn is_empty(&self, identifier: &str) -> QueueResult<bool>;

    /// Write a progress snapshot for its batch.
    async fn write_status(&self, status: &BatchStatus) -> QueueResult<()>;

    /// Read the progress snapshot for a batch, if one exists.
    async fn read_status(&self, key: &BatchKey) -> QueueResult<Option<BatchStatus>>;

    /// Signal the running (or next-triggered) worker to discard this batch.
    async fn request_cancel(&self, key: &BatchKey) -> QueueResult<()>;

    async fn is_cancel_requested(&self, key: &BatchKey) -> QueueResult<bool>;

    async fn clear_cancel(&self, key: &BatchKey) -> QueueResult<()>;

    /// Atomically acquire the per-identifier worker lock.
    async fn try_lock(&self, identifier: &str, ttl: Duration) -> QueueResult<Option<LockLease>>;

    /// Extend a held lease. Returns `false` when the lease is no longer owned.
    async fn renew_lock(
        &self,
        identifier: &str,
        lease: &LockLease,
        ttl: Duration,
    ) -> QueueResult<bool>;

    /// Release a held lease. Returns `false` when the lease was not owned.
    async fn unlock(&self, identifier: &str, lease: &LockLease) -> QueueResult<bool>;

    /// Whether any worker currently holds the lock.
    async fn is_locked(&self, identifier: &str) -> QueueResult<bool>;

    /// Record an item that exhausted its retry budget.
    async fn push_dead_letter(&self, identifier: &str, dead: &DeadLetter) -> QueueResult<()>;

    async fn dead_letter_len(&self, identifier: &str) -> QueueResult<u64>;
}
