//! Batch progress snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Batch, BatchKey};

/// Side-channel progress snapshot for one batch.
///
/// Written before and after each item so operators can see where a cycle is
/// and how fast it moves. Deleted together with its batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchStatus {
    /// Batch this snapshot describes
    pub key: BatchKey,
    /// Item count at save time
    pub total: u32,
    /// Items left to process
    pub remaining: u32,
    /// Action of the most recently finished item
    pub last_step: Option<String>,
    /// Action of the item about to run, cleared once it finishes
    pub next_step: Option<String>,
    /// Wall-clock duration of the last finished item, in milliseconds
    pub time_last_step_ms: u64,
    /// Items finished during the current worker cycle
    pub items_last_step: u32,
    /// Accumulated processing time across cycles, in milliseconds
    pub total_time_ms: u64,
    /// Resident memory as a percent of the worker's limit at the last step
    pub memory_percent: f32,
    /// When this snapshot was written
    pub updated_at: DateTime<Utc>,
}

impl BatchStatus {
    /// Initial snapshot for a freshly saved batch.
    pub fn new(batch: &Batch) -> Self {
        Self {
            key: batch.key.clone(),
            total: batch.total,
            remaining: batch.remaining(),
            last_step: None,
            next_step: None,
            time_last_step_ms: 0,
            items_last_step: 0,
            total_time_ms: 0,
            memory_percent: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// A new worker cycle is starting on this batch.
    pub fn begin_cycle(&mut self) {
        self.items_last_step = 0;
        self.updated_at = Utc::now();
    }

    /// An item is about to run.
    pub fn begin_step(&mut self, action: &str, remaining: u32) {
        self.next_step = Some(action.to_string());
        self.remaining = remaining;
        self.updated_at = Utc::now();
    }

    /// An item finished and was removed from the batch.
    pub fn finish_step(
        &mut self,
        action: &str,
        elapsed: Duration,
        remaining: u32,
        memory_percent: f32,
    ) {
        let elapsed_ms = elapsed.as_millis() as u64;
        self.last_step = Some(action.to_string());
        self.next_step = None;
        self.time_last_step_ms = elapsed_ms;
        self.items_last_step += 1;
        self.total_time_ms += elapsed_ms;
        self.remaining = remaining;
        self.memory_percent = memory_percent;
        self.updated_at = Utc::now();
    }
}
