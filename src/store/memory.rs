use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::store::traits::{QueueRecord, QueueStore};

/// In-memory store. No durability; useful in tests and in deployments that
/// accept losing queued notifications on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, QueueRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl QueueStore for MemoryStore {
    fn put(&self, record: &QueueRecord) -> StoreResult<()> {
        self.records
            .lock()
            .insert(record.notification.id, record.clone());
        Ok(())
    }

    fn remove(&self, id: &Uuid) -> StoreResult<()> {
        self.records.lock().remove(id);
        Ok(())
    }

    fn load_all(&self) -> StoreResult<Vec<QueueRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
