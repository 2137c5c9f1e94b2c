use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::traits::{QueueRecord, QueueStore};

/// Directory-backed store: one JSON document per queued notification,
/// named `<id>.json`. Durable enough for restart recovery of a
/// single-process queue; corrupt documents are skipped (and logged) on
/// load rather than failing the whole recovery.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl QueueStore for JsonFileStore {
    fn put(&self, record: &QueueRecord) -> StoreResult<()> {
        let bytes = serde_json::to_vec(record)?;
        // Write-then-rename so a crash mid-write never leaves a truncated
        // record under the final name.
        let tmp = self.dir.join(format!("{}.tmp", record.notification.id));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.path_for(&record.notification.id))?;
        Ok(())
    }

    fn remove(&self, id: &Uuid) -> StoreResult<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from(e)),
        }
    }

    fn load_all(&self) -> StoreResult<Vec<QueueRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable queue record, skipping");
                    continue;
                }
            };
            match serde_json::from_slice::<QueueRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt queue record, skipping");
                }
            }
        }
        Ok(records)
    }
}
