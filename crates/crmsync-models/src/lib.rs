//! Shared data models for the crmsync batch engine.
//!
//! This crate provides Serde-serializable types for:
//! - Work items and persisted batches
//! - Batch progress snapshots
//! - Dead-lettered items
//! - Memory limit parsing for the worker resource guard

pub mod batch;
pub mod item;
pub mod memory;
pub mod status;

// Re-export common types
pub use batch::{Batch, BatchKey, MAX_KEY_LEN};
pub use item::{DeadLetter, WorkItem};
pub use memory::{parse_memory_limit, MemoryBudget, DEFAULT_MEMORY_LIMIT_BYTES};
pub use status::BatchStatus;
