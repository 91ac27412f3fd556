//! Snapshot persistence.
//!
//! A snapshot file holds the op index it covers followed by the opaque
//! state-machine payload:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────────┐
//! │  Covered op index    │            Payload               │
//! │  (8 bytes, LE u64)   │           (variable)             │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Writes go to a temporary file that is fsynced and then renamed over the
//! canonical file, so a crash leaves either the old snapshot or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{VrError, VrResult};
use crate::types::OpNumber;

/// Canonical snapshot file name inside the data directory.
pub const SNAPSHOT_FILE: &str = "snapshot.bin";

const HEADER_SIZE: usize = 8;

/// State-machine state covering every op up to and including `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: OpNumber,
    pub payload: Bytes,
}

impl Snapshot {
    pub fn new(index: OpNumber, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            payload: payload.into(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.index.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let (header, payload) = bytes.split_first_chunk::<HEADER_SIZE>()?;
        Some(Self {
            index: OpNumber::new(u64::from_le_bytes(*header)),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Writes and reloads the snapshot file of one replica.
///
/// At most one snapshot is written at a time. A request covering an index at
/// or below the current one is skipped.
#[derive(Debug)]
pub struct SnapshotManager {
    path: PathBuf,
    write_lock: Mutex<()>,
    covered: AtomicU64,
}

impl SnapshotManager {
    /// Creates a manager for `data_dir`, creating the directory if needed.
    pub fn new(data_dir: &Path) -> VrResult<Self> {
        fs::create_dir_all(data_dir).map_err(|source| VrError::Snapshot {
            path: data_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: data_dir.join(SNAPSHOT_FILE),
            write_lock: Mutex::new(()),
            covered: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest index persisted or loaded so far.
    pub fn covered(&self) -> OpNumber {
        OpNumber::new(self.covered.load(Ordering::Acquire))
    }

    /// Persists `snapshot`.
    ///
    /// Returns `Ok(false)` without touching the disk if the snapshot does not
    /// advance the covered index. This is blocking I/O.
    pub fn take(&self, snapshot: &Snapshot) -> VrResult<bool> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if snapshot.index <= self.covered() {
            debug!(index = %snapshot.index, covered = %self.covered(), "snapshot skipped");
            return Ok(false);
        }

        let tmp = self.path.with_extension("tmp");
        let io_err = |source| VrError::Snapshot {
            path: tmp.clone(),
            source,
        };

        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&snapshot.encode()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|source| VrError::Snapshot {
            path: self.path.clone(),
            source,
        })?;

        self.covered
            .store(snapshot.index.as_u64(), Ordering::Release);
        info!(index = %snapshot.index, bytes = snapshot.payload.len(), "snapshot written");
        Ok(true)
    }

    /// Reads the snapshot file, if one exists.
    pub fn load(&self) -> VrResult<Option<Snapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(VrError::Snapshot {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let snapshot =
            Snapshot::decode(&bytes).ok_or_else(|| VrError::CorruptSnapshot(self.path.clone()))?;
        self.covered
            .fetch_max(snapshot.index.as_u64(), Ordering::AcqRel);
        info!(index = %snapshot.index, "snapshot loaded");
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SnapshotManager::new(dir.path()).expect("manager");

        let snapshot = Snapshot::new(OpNumber::new(42), Bytes::from_static(b"state"));
        assert!(manager.take(&snapshot).expect("take"));

        let reopened = SnapshotManager::new(dir.path()).expect("manager");
        assert_eq!(reopened.load().expect("load"), Some(snapshot));
        assert_eq!(reopened.covered(), OpNumber::new(42));
    }

    #[test]
    fn stale_snapshot_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SnapshotManager::new(dir.path()).expect("manager");

        assert!(manager.take(&Snapshot::new(OpNumber::new(10), "new")).expect("take"));
        assert!(!manager.take(&Snapshot::new(OpNumber::new(10), "same")).expect("take"));
        assert!(!manager.take(&Snapshot::new(OpNumber::new(5), "old")).expect("take"));

        let loaded = manager.load().expect("load").expect("snapshot");
        assert_eq!(loaded.payload, Bytes::from_static(b"new"));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SnapshotManager::new(dir.path()).expect("manager");
        assert_eq!(manager.load().expect("load"), None);
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SnapshotManager::new(dir.path()).expect("manager");
        fs::write(manager.path(), [1, 2, 3]).expect("write");
        assert!(matches!(manager.load(), Err(VrError::CorruptSnapshot(_))));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SnapshotManager::new(dir.path()).expect("manager");
        manager
            .take(&Snapshot::new(OpNumber::new(1), "x"))
            .expect("take");

        let names: Vec<_> = fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(SNAPSHOT_FILE)]);
    }
}
