//! Metric names and recorders for the batch engine.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const ITEMS_COMPLETED_TOTAL: &str = "crmsync_items_completed_total";
    pub const ITEMS_RETRIED_TOTAL: &str = "crmsync_items_retried_total";
    pub const ITEMS_DEAD_LETTERED_TOTAL: &str = "crmsync_items_dead_lettered_total";

    pub const BATCHES_COMPLETED_TOTAL: &str = "crmsync_batches_completed_total";
    pub const BATCHES_CANCELLED_TOTAL: &str = "crmsync_batches_cancelled_total";

    pub const WORKER_CYCLES_TOTAL: &str = "crmsync_worker_cycles_total";
    pub const QUEUE_BATCHES: &str = "crmsync_queue_batches";
}

pub fn record_item_completed() {
    counter!(names::ITEMS_COMPLETED_TOTAL).increment(1);
}

pub fn record_item_retried() {
    counter!(names::ITEMS_RETRIED_TOTAL).increment(1);
}

pub fn record_item_dead_lettered() {
    counter!(names::ITEMS_DEAD_LETTERED_TOTAL).increment(1);
}

pub fn record_batch_completed() {
    counter!(names::BATCHES_COMPLETED_TOTAL).increment(1);
}

pub fn record_batch_cancelled() {
    counter!(names::BATCHES_CANCELLED_TOTAL).increment(1);
}

pub fn record_cycle() {
    counter!(names::WORKER_CYCLES_TOTAL).increment(1);
}

pub fn set_queue_depth(batches: usize) {
    gauge!(names::QUEUE_BATCHES).set(batches as f64);
}
