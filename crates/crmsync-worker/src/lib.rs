//! Batch worker engine.
//!
//! This crate provides:
//! - [`BatchEngine`]: lock-guarded worker cycles over the durable queue,
//!   with wall-clock and memory budgets and cooperative cancellation
//! - [`TaskHandler`]: the extension point where per-item work is injected
//! - Wake-channel dispatch and a periodic healthcheck that restarts stalled
//!   processing

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod resource;
pub mod task;

pub use config::WorkerConfig;
pub use engine::{BatchEngine, DispatchOutcome};
pub use error::{WorkerError, WorkerResult};
pub use resource::MemoryProbe;
pub use task::{TaskHandler, TaskOutcome};
