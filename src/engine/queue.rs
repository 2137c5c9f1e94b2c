use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::stats::QueueStats;
use crate::notification::{Notification, Priority};
use crate::store::{QueueRecord, QueueStore};

struct Inner {
    /// One bucket per priority tier, each sorted by scheduled_at ascending.
    buckets: HashMap<Priority, Vec<QueueRecord>>,
    /// Ids currently handed out by `dequeue` and not yet marked processed.
    processing: HashSet<Uuid>,
    /// Future-dated entries waiting on their timer.
    scheduled: HashMap<Uuid, (QueueRecord, JoinHandle<()>)>,
    /// Every id the queue currently holds, in any state.
    ids: HashSet<Uuid>,
    enqueued_total: u64,
    dequeued_total: u64,
    processed_total: u64,
    failed_total: u64,
}

impl Inner {
    fn queued_len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn insert_sorted(&mut self, record: QueueRecord) {
        let bucket = self.buckets.entry(record.priority).or_default();
        let pos = bucket.partition_point(|r| r.scheduled_at <= record.scheduled_at);
        bucket.insert(pos, record);
    }
}

/// In-memory priority queue with optional crash-recovery persistence.
///
/// Ordering is priority weight descending, then eligibility time ascending
/// within a tier. A dequeued id sits in the processing set until
/// `mark_processed`, so concurrent ticks can never hand out the same
/// notification twice. Full queue rejects new work instead of evicting.
pub struct PriorityQueue {
    inner: Arc<Mutex<Inner>>,
    store: Option<Arc<dyn QueueStore>>,
    max_size: usize,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self::with_store(max_size, None)
    }

    pub fn with_store(max_size: usize, store: Option<Arc<dyn QueueStore>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buckets: HashMap::new(),
                processing: HashSet::new(),
                scheduled: HashMap::new(),
                ids: HashSet::new(),
                enqueued_total: 0,
                dequeued_total: 0,
                processed_total: 0,
                failed_total: 0,
            })),
            store,
            max_size,
        }
    }

    /// Add an immediately-eligible notification. Returns false when the
    /// queue is at capacity or already holds this id.
    pub fn enqueue(&self, notification: Notification) -> bool {
        let record = QueueRecord {
            scheduled_at: notification.effective_schedule(),
            priority: notification.priority,
            attempts: notification.meta.redeliveries,
            notification,
        };
        let id = record.notification.id;
        {
            let mut inner = self.inner.lock();
            if inner.queued_len() + inner.scheduled.len() >= self.max_size {
                debug!(%id, "queue at capacity, rejecting enqueue");
                return false;
            }
            if inner.processing.contains(&id) || !inner.ids.insert(id) {
                debug!(%id, "id already active, rejecting enqueue");
                return false;
            }
            inner.enqueued_total += 1;
            inner.insert_sorted(record.clone());
        }
        self.persist(&record);
        true
    }

    /// Hold a notification until `at`, then move it into its bucket. The
    /// timer is abortable via `cancel_scheduled` or `remove` until it
    /// fires. Returns false on capacity or duplicate id, like `enqueue`.
    pub fn schedule(&self, notification: Notification, at: DateTime<Utc>) -> bool {
        let record = QueueRecord {
            scheduled_at: at,
            priority: notification.priority,
            attempts: notification.meta.redeliveries,
            notification,
        };
        let id = record.notification.id;
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        {
            let mut inner = self.inner.lock();
            if inner.queued_len() + inner.scheduled.len() >= self.max_size {
                debug!(%id, "queue at capacity, rejecting schedule");
                return false;
            }
            if inner.processing.contains(&id) || !inner.ids.insert(id) {
                debug!(%id, "id already active, rejecting schedule");
                return false;
            }
            inner.enqueued_total += 1;
            let handle = self.spawn_timer(id, delay);
            inner.scheduled.insert(id, (record.clone(), handle));
        }
        self.persist(&record);
        true
    }

    fn spawn_timer(&self, id: Uuid, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = inner.lock();
            if let Some((record, _)) = inner.scheduled.remove(&id) {
                inner.insert_sorted(record);
            }
        })
    }

    /// Abort a pending timer and drop the entry. Returns false once the
    /// timer has fired (the entry is then a regular queued entry; use
    /// `remove`).
    pub fn cancel_scheduled(&self, id: &Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.scheduled.remove(id) {
                Some((_, handle)) => {
                    handle.abort();
                    inner.ids.remove(id);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.unpersist(id);
        }
        removed
    }

    /// Delete a queued or scheduled notification outright. In-flight
    /// (processing) ids are not touched.
    pub fn remove(&self, id: &Uuid) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            if let Some((_, handle)) = inner.scheduled.remove(id) {
                handle.abort();
                inner.ids.remove(id);
                true
            } else {
                let mut found = false;
                for bucket in inner.buckets.values_mut() {
                    if let Some(pos) = bucket.iter().position(|r| r.notification.id == *id) {
                        bucket.remove(pos);
                        found = true;
                        break;
                    }
                }
                if found {
                    inner.ids.remove(id);
                }
                found
            }
        };
        if removed {
            self.unpersist(id);
        }
        removed
    }

    /// Take up to `max` eligible entries in priority order. Dequeued ids
    /// enter the processing set and their persisted records are removed.
    pub fn dequeue(&self, max: usize, now: DateTime<Utc>) -> Vec<QueueRecord> {
        let mut taken = Vec::new();
        {
            let mut inner = self.inner.lock();
            'outer: for priority in Priority::DESCENDING {
                let Some(bucket) = inner.buckets.get_mut(&priority) else {
                    continue;
                };
                // Sorted by scheduled_at, so everything past the first
                // ineligible entry is ineligible too.
                while taken.len() < max {
                    match bucket.first() {
                        Some(record) if record.scheduled_at <= now => {
                            taken.push(bucket.remove(0));
                        }
                        _ => continue 'outer,
                    }
                }
                break;
            }
            for record in &taken {
                let id = record.notification.id;
                inner.ids.remove(&id);
                inner.processing.insert(id);
                inner.dequeued_total += 1;
            }
        }
        for record in &taken {
            self.unpersist(&record.notification.id);
        }
        taken
    }

    /// Release a dequeued id from the processing set.
    pub fn mark_processed(&self, id: &Uuid, success: bool) {
        let mut inner = self.inner.lock();
        if inner.processing.remove(id) {
            if success {
                inner.processed_total += 1;
            } else {
                inner.failed_total += 1;
            }
        }
    }

    /// Release a dequeued id without counting the cycle in the processed
    /// or failed totals, for entries that re-enter the queue instead of
    /// finishing.
    pub fn release(&self, id: &Uuid) {
        self.inner.lock().processing.remove(id);
    }

    /// Reload persisted records after a restart. Past-due records land in
    /// their buckets; future-dated ones get a fresh timer. Returns the
    /// number of records restored.
    pub fn restore(&self, now: DateTime<Utc>) -> crate::error::StoreResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let records = store.load_all()?;
        let mut restored = 0;
        let mut inner = self.inner.lock();
        for record in records {
            let id = record.notification.id;
            if !inner.ids.insert(id) {
                continue;
            }
            inner.enqueued_total += 1;
            restored += 1;
            if record.scheduled_at > now {
                let delay = (record.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
                let handle = self.spawn_timer(id, delay);
                inner.scheduled.insert(id, (record, handle));
            } else {
                inner.insert_sorted(record);
            }
        }
        Ok(restored)
    }

    /// Immediately-eligible-or-waiting entries, excluding processing ids.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.queued_len() + inner.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut depth_by_priority = HashMap::new();
        for priority in Priority::DESCENDING {
            let depth = inner.buckets.get(&priority).map_or(0, Vec::len);
            depth_by_priority.insert(priority, depth);
        }
        QueueStats {
            queued: inner.queued_len(),
            scheduled: inner.scheduled.len(),
            processing: inner.processing.len(),
            depth_by_priority,
            enqueued_total: inner.enqueued_total,
            dequeued_total: inner.dequeued_total,
            processed_total: inner.processed_total,
            failed_total: inner.failed_total,
        }
    }

    fn persist(&self, record: &QueueRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(record) {
                warn!(id = %record.notification.id, error = %e, "failed to persist queue record");
            }
        }
    }

    fn unpersist(&self, id: &Uuid) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(id) {
                warn!(%id, error = %e, "failed to remove queue record");
            }
        }
    }
}
