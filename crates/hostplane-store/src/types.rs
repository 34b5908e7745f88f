//! Row types that exist only in the store.

use serde::{Deserialize, Serialize};

use hostplane_core::InstanceStatus;

/// One recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub instance_id: String,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    /// Task whose outcome this change records.
    pub task_id: String,
    pub at: i64,
}

/// Task counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queue: String,
    pub pending: u64,
    pub started: u64,
}
