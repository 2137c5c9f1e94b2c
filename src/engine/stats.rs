use std::collections::HashMap;

use crate::notification::Priority;

/// Point-in-time queue snapshot plus lifetime counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries sitting in priority buckets.
    pub queued: usize,
    /// Entries waiting on a future-dated timer.
    pub scheduled: usize,
    /// Ids handed out by dequeue and not yet marked processed.
    pub processing: usize,
    pub depth_by_priority: HashMap<Priority, usize>,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub processed_total: u64,
    pub failed_total: u64,
}

/// Engine-level aggregate returned by `Engine::stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub created: u64,
    pub delivered: u64,
    /// Partial deliveries: at least one channel succeeded, at least one failed.
    pub sent: u64,
    pub failed: u64,
    pub blocked: u64,
    pub expired: u64,
    /// Failed cycles re-queued for another delivery pass.
    pub redelivered: u64,
}
