//! Durable batch queue store.
//!
//! This crate provides:
//! - The [`BatchStore`] contract shared by all backends
//! - A Redis backend for production and an in-memory backend for tests and
//!   embedded use
//! - Lock leases, cancel flags, progress status records, and dead letters
//! - The [`PendingBatch`] enqueue builder

pub mod error;
pub mod pending;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use pending::{PendingBatch, STATUS_ITEM_THRESHOLD};
pub use store::memory::MemoryStore;
pub use store::redis::{RedisStore, StoreConfig};
pub use store::{BatchStore, LockLease, DEFAULT_MAX_PAYLOAD_BYTES};
