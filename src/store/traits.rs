use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::notification::{Notification, Priority};

/// One persisted row per in-flight queue entry, keyed by notification id.
/// Written on enqueue, removed once the entry is dequeued for processing,
/// re-read only during crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub notification: Notification,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Persistence trait for crash recovery of queued notifications.
/// Implementations must be thread-safe; operations can only fail with
/// infrastructure errors, never domain errors.
pub trait QueueStore: Send + Sync {
    /// Persist (or overwrite) the record for a queue entry.
    fn put(&self, record: &QueueRecord) -> StoreResult<()>;

    /// Remove the record for a notification id. Removing a missing id is not
    /// an error.
    fn remove(&self, id: &Uuid) -> StoreResult<()>;

    /// Load every persisted record, in no particular order.
    fn load_all(&self) -> StoreResult<Vec<QueueRecord>>;
}
