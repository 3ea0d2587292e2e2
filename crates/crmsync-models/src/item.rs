//! Work item definitions for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::BatchKey;

/// One unit of queued work, opaque to the engine.
///
/// `action` names the operation a task handler should perform (for a CRM
/// sync handler: `"apply_tags"`, `"update_contact"`, ...) and `args` is the
/// free-form payload it interprets. The engine never looks inside either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkItem {
    /// Operation name, interpreted by the task handler
    pub action: String,
    /// Opaque arguments for the handler
    #[serde(default)]
    pub args: Vec<Value>,
    /// Times this item has been handed back for another pass
    #[serde(default)]
    pub attempts: u32,
}

impl WorkItem {
    /// Create a new work item with no arguments.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Vec::new(),
            attempts: 0,
        }
    }

    /// Append a single argument.
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the argument list.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// An item removed from its batch after exhausting the retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeadLetter {
    /// Batch the item was removed from
    pub batch_key: BatchKey,
    /// The item as it looked on its final attempt
    pub item: WorkItem,
    /// Why the item was dead-lettered
    pub error: String,
    /// When the item was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Record an item with the reason it was given up on.
    pub fn new(batch_key: BatchKey, item: WorkItem, error: impl Into<String>) -> Self {
        Self {
            batch_key,
            item,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}
