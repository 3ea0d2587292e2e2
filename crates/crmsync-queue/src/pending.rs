//! Enqueue builder.

use std::sync::Arc;

use tracing::debug;

use crmsync_models::{Batch, BatchStatus, WorkItem};

use crate::error::QueueResult;
use crate::store::BatchStore;

/// Item count above which `save` also writes an initial status record, so
/// progress on large batches is visible before the first worker cycle.
pub const STATUS_ITEM_THRESHOLD: usize = 10;

/// Items accumulated before being persisted as one batch.
///
/// `push` chains; `save` persists the pending items under a fresh batch key
/// and returns the batch, or `None` when nothing was pushed.
pub struct PendingBatch {
    store: Arc<dyn BatchStore>,
    identifier: String,
    items: Vec<WorkItem>,
}

impl PendingBatch {
    pub fn new(store: Arc<dyn BatchStore>, identifier: impl Into<String>) -> Self {
        Self {
            store,
            identifier: identifier.into(),
            items: Vec::new(),
        }
    }

    /// Append one item to the pending batch.
    pub fn push(mut self, item: WorkItem) -> Self {
        self.items.push(item);
        self
    }

    /// Append several items in order.
    pub fn push_all(mut self, items: impl IntoIterator<Item = WorkItem>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Persist the pending items as a new batch.
    pub async fn save(self) -> QueueResult<Option<Batch>> {
        let Self {
            store,
            identifier,
            items,
        } = self;

        if items.is_empty() {
            return Ok(None);
        }

        let batch = store.save(&identifier, items).await?;
        debug!(key = %batch.key, total = batch.total, "Saved batch");

        if batch.total as usize > STATUS_ITEM_THRESHOLD {
            store.write_status(&BatchStatus::new(&batch)).await?;
        }

        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    const IDENT: &str = "crmsync";

    #[tokio::test]
    async fn save_with_no_items_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let saved = PendingBatch::new(store.clone(), IDENT).save().await.unwrap();

        assert!(saved.is_none());
        assert!(store.is_empty(IDENT).await.unwrap());
    }

    #[tokio::test]
    async fn push_chains_and_preserves_order() {
        let store = Arc::new(MemoryStore::new());
        let saved = PendingBatch::new(store.clone(), IDENT)
            .push(WorkItem::new("first"))
            .push(WorkItem::new("second"))
            .push(WorkItem::new("third"))
            .save()
            .await
            .unwrap()
            .unwrap();

        let actions: Vec<&str> = saved.items.iter().map(|i| i.action.as_str()).collect();
        assert_eq!(actions, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn small_batches_skip_the_initial_status_record() {
        let store = Arc::new(MemoryStore::new());
        let saved = PendingBatch::new(store.clone(), IDENT)
            .push_all((0..3).map(|i| WorkItem::new(format!("op_{i}"))))
            .save()
            .await
            .unwrap()
            .unwrap();

        assert!(store.read_status(&saved.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_batches_get_an_initial_status_record() {
        let store = Arc::new(MemoryStore::new());
        let saved = PendingBatch::new(store.clone(), IDENT)
            .push_all((0..15).map(|i| WorkItem::new(format!("op_{i}"))))
            .save()
            .await
            .unwrap()
            .unwrap();

        let status = store.read_status(&saved.key).await.unwrap().unwrap();
        assert_eq!(status.total, 15);
        assert_eq!(status.remaining, 15);
    }
}
