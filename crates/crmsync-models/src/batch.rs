//! Persisted batches and their storage keys.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::WorkItem;

/// Maximum length of a generated batch key.
pub const MAX_KEY_LEN: usize = 64;

/// Separator between the queue identifier and the random suffix.
const KEY_INFIX: &str = "_batch_";

/// Storage key for a persisted batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct BatchKey(pub String);

impl BatchKey {
    /// Generate a fresh key for the given queue identifier.
    ///
    /// Keys are practically unique, not cryptographically unique: the v4 UUID
    /// suffix carries 122 bits of randomness, and the result is truncated to
    /// [`MAX_KEY_LEN`] characters.
    pub fn generate(identifier: &str) -> Self {
        let mut key = format!("{}{}{}", identifier, KEY_INFIX, Uuid::new_v4().simple());
        key.truncate(MAX_KEY_LEN);
        Self(key)
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The queue identifier embedded in this key.
    pub fn identifier(&self) -> &str {
        self.0
            .rsplit_once(KEY_INFIX)
            .map(|(identifier, _)| identifier)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted, ordered set of work items processed together under one lock
/// cycle sequence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Batch {
    /// Storage key
    pub key: BatchKey,
    /// Remaining items, in original insertion order
    pub items: Vec<WorkItem>,
    /// Item count at save time
    pub total: u32,
    /// When the batch was saved
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Create a batch from its key and items.
    pub fn new(key: BatchKey, items: Vec<WorkItem>) -> Self {
        let total = items.len() as u32;
        Self {
            key,
            items,
            total,
            created_at: Utc::now(),
        }
    }

    /// Items left to process.
    pub fn remaining(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
