//! Task handler contract.

use async_trait::async_trait;

use crmsync_models::{BatchKey, WorkItem};

/// What the handler wants done with an item after one attempt.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Item is finished; remove it from the batch.
    Complete,
    /// Keep a (possibly modified) item at its position for the next pass.
    Retry(WorkItem),
}

/// Per-item work injected by the host.
///
/// This is the extension point where the actual sync work lives: a CRM
/// handler interprets `item.action` and `item.args`, makes its API calls,
/// and reports back. Handlers own their error handling; a failed attempt is
/// expressed as `Retry` (try again next cycle) or `Complete` (give up and
/// drop the item). The engine never inspects task errors.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one work item.
    async fn run(&self, item: WorkItem) -> TaskOutcome;

    /// Invoked once each time the queue drains.
    async fn on_complete(&self) {}

    /// Invoked after a batch is discarded by a cancel request.
    async fn on_cancelled(&self, _key: &BatchKey) {}
}
