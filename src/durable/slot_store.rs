//! Durable key-value slots for snapshots
//!
//! One slot per logical database name, holding only the latest
//! [`SnapshotRecord`]. A `put` either replaces the slot completely or
//! leaves the previous value in place.
//!
//! On disk each slot is `<slot>.slot`: one JSON [`SnapshotHeader`] line
//! followed by the raw export bytes. A `VERSION` file records the
//! container layout; layout 0 (bare `<slot>.snapshot` files holding only
//! the bytes) is upgraded on first open.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::{SnapshotHeader, SnapshotRecord};
use crate::utils::{atomic_write_with, cleanup_temp_files, now_millis};

/// Current container layout of [`FileSlotStore`]
pub const SLOT_LAYOUT_VERSION: u32 = 1;

const VERSION_FILE: &str = "VERSION";
const LEGACY_EXTENSION: &str = "snapshot";
const SLOT_EXTENSION: &str = "slot";

/// Durable storage for the latest snapshot of each database
pub trait SlotStore: Send + Sync {
    /// Latest record in `slot`, `None` if it was never written
    fn get(&self, slot: &str) -> SyncResult<Option<SnapshotRecord>>;

    /// Replace `slot` with `record` in one step
    fn put(&self, slot: &str, record: &SnapshotRecord) -> SyncResult<()>;
}

/// Slot store backed by one directory
#[derive(Debug, Clone)]
pub struct FileSlotStore {
    dir: PathBuf,
}

impl FileSlotStore {
    /// Open the directory, creating or upgrading it as needed
    pub fn open<P: AsRef<Path>>(dir: P) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let cleaned = cleanup_temp_files(&dir)?;
        if cleaned > 0 {
            warn!(dir = %dir.display(), cleaned, "removed temp files left by an interrupted write");
        }

        let store = Self { dir };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Layout version recorded on disk; 0 when no marker exists
    pub fn layout_version(&self) -> SyncResult<u32> {
        match fs::read_to_string(self.dir.join(VERSION_FILE)) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| SyncError::SlotStore(format!("unreadable VERSION marker '{}'", raw.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_layout(&self) -> SyncResult<()> {
        let version = self.layout_version()?;
        if version > SLOT_LAYOUT_VERSION {
            return Err(SyncError::SlotStore(format!(
                "slot layout {} is newer than supported {}",
                version, SLOT_LAYOUT_VERSION
            )));
        }
        if version < SLOT_LAYOUT_VERSION {
            let upgraded = self.upgrade_from_v0()?;
            atomic_write_with(self.dir.join(VERSION_FILE), |file| {
                write!(file, "{}", SLOT_LAYOUT_VERSION)
            })?;
            info!(dir = %self.dir.display(), upgraded, "slot store upgraded to layout {}", SLOT_LAYOUT_VERSION);
        }
        Ok(())
    }

    /// Wrap every bare legacy snapshot in a header
    fn upgrade_from_v0(&self) -> SyncResult<usize> {
        let legacy = fs::read_dir(&self.dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(LEGACY_EXTENSION));

        let mut upgraded = 0;
        for path in legacy {
            let Some(slot) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let bytes = fs::read(&path)?;
            let written_at_millis = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
                .unwrap_or_else(|_| now_millis());
            let record = SnapshotRecord {
                bytes,
                written_at_millis,
            };

            self.put(slot, &record)?;
            fs::remove_file(&path)?;
            debug!(slot, bytes = record.bytes.len(), "upgraded legacy snapshot");
            upgraded += 1;
        }
        Ok(upgraded)
    }

    fn slot_path(&self, slot: &str) -> SyncResult<PathBuf> {
        let valid = !slot.is_empty()
            && !slot.starts_with('.')
            && slot
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(SyncError::SlotStore(format!("invalid slot name '{}'", slot)));
        }
        Ok(self.dir.join(format!("{}.{}", slot, SLOT_EXTENSION)))
    }
}

impl SlotStore for FileSlotStore {
    fn get(&self, slot: &str) -> SyncResult<Option<SnapshotRecord>> {
        let path = self.slot_path(slot)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let split = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| SyncError::SlotStore(format!("slot '{}' has no header", slot)))?;
        let header: SnapshotHeader = serde_json::from_slice(&raw[..split])?;
        let bytes = raw[split + 1..].to_vec();

        if bytes.len() as u64 != header.length {
            return Err(SyncError::SlotStore(format!(
                "slot '{}' truncated: header says {} bytes, found {}",
                slot,
                header.length,
                bytes.len()
            )));
        }

        Ok(Some(SnapshotRecord {
            bytes,
            written_at_millis: header.written_at_millis,
        }))
    }

    fn put(&self, slot: &str, record: &SnapshotRecord) -> SyncResult<()> {
        let path = self.slot_path(slot)?;
        let header = serde_json::to_vec(&record.header())?;
        atomic_write_with(&path, |file| {
            file.write_all(&header)?;
            file.write_all(b"\n")?;
            file.write_all(&record.bytes)
        })?;
        debug!(slot, bytes = record.bytes.len(), "slot written");
        Ok(())
    }
}

/// In-memory slot store for tests and single-process setups
#[derive(Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<String, SnapshotRecord>>,
    fail_puts: AtomicBool,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail until switched back
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, slot: &str) -> bool {
        self.slots.lock().contains_key(slot)
    }
}

impl SlotStore for MemorySlotStore {
    fn get(&self, slot: &str) -> SyncResult<Option<SnapshotRecord>> {
        Ok(self.slots.lock().get(slot).cloned())
    }

    fn put(&self, slot: &str, record: &SnapshotRecord) -> SyncResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(SyncError::SlotStore(format!("put to '{}' rejected", slot)));
        }
        self.slots.lock().insert(slot.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_slot_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSlotStore::open(temp_dir.path()).unwrap();
        assert!(store.get("notes").unwrap().is_none());
        assert_eq!(store.layout_version().unwrap(), SLOT_LAYOUT_VERSION);
    }

    #[test]
    fn test_put_replaces_previous_value() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSlotStore::open(temp_dir.path()).unwrap();

        store.put("notes", &SnapshotRecord::new(vec![1; 4096])).unwrap();
        let second = SnapshotRecord::new(vec![2, 0, b'\n', 3]);
        store.put("notes", &second).unwrap();

        assert_eq!(store.get("notes").unwrap(), Some(second));
        let files: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2); // VERSION + notes.slot
    }

    #[test]
    fn test_truncated_slot_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSlotStore::open(temp_dir.path()).unwrap();
        store.put("notes", &SnapshotRecord::new(vec![7; 100])).unwrap();

        let path = temp_dir.path().join("notes.slot");
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 10]).unwrap();

        assert!(matches!(store.get("notes"), Err(SyncError::SlotStore(_))));
    }

    #[test]
    fn test_legacy_layout_is_upgraded() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("notes.snapshot"), b"legacy-bytes").unwrap();
        fs::write(temp_dir.path().join("notes.tmp"), b"half").unwrap();

        let store = FileSlotStore::open(temp_dir.path()).unwrap();

        let record = store.get("notes").unwrap().unwrap();
        assert_eq!(record.bytes, b"legacy-bytes");
        assert!(record.written_at_millis > 0);
        assert!(!temp_dir.path().join("notes.snapshot").exists());
        assert!(!temp_dir.path().join("notes.tmp").exists());

        // Reopening does not upgrade twice
        let reopened = FileSlotStore::open(temp_dir.path()).unwrap();
        assert_eq!(reopened.get("notes").unwrap().unwrap().bytes, b"legacy-bytes");
    }

    #[test]
    fn test_newer_layout_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("VERSION"), "9").unwrap();
        assert!(matches!(
            FileSlotStore::open(temp_dir.path()),
            Err(SyncError::SlotStore(_))
        ));
    }

    #[test]
    fn test_memory_store_failure_toggle() {
        let store = MemorySlotStore::new();
        store.set_fail_puts(true);
        assert!(store.put("notes", &SnapshotRecord::new(vec![1])).is_err());
        assert!(!store.contains("notes"));

        store.set_fail_puts(false);
        store.put("notes", &SnapshotRecord::new(vec![1])).unwrap();
        assert!(store.contains("notes"));
    }
}
