//! Client-local persistence of the active timer snapshot.
//!
//! One JSON record is kept under a fixed key so a reload can show the
//! running timer before the backend answers. The snapshot is a cache: it is
//! cleared on stop and whenever it disagrees with the authoritative record.
//!
//! Storage never fails loudly. Write and remove errors are logged and
//! dropped; a snapshot that is unreadable or missing a required field is
//! removed and reported as absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{ActiveTimerRecord, EntityRef};
use crate::error::{Result, SyncError};

/// Fields every stored snapshot must carry.
const REQUIRED_FIELDS: [&str; 5] = [
    "entry_id",
    "entity_type",
    "entity_id",
    "display_name",
    "start_time",
];

/// Non-authoritative local copy of the running timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTimerSnapshot {
    /// Backend record id.
    pub entry_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    /// Label shown next to the live elapsed time.
    pub display_name: String,
    /// Server-assigned start time.
    pub start_time: DateTime<Utc>,
}

impl LocalTimerSnapshot {
    /// Build a snapshot from an authoritative record and a display label.
    pub fn from_record(record: &ActiveTimerRecord, display_name: impl Into<String>) -> Self {
        Self {
            entry_id: record.id,
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            display_name: display_name.into(),
            start_time: record.start_time,
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(self.entity_type.clone(), self.entity_id.clone())
    }
}

/// Key/value storage contract (one JSON string per key).
pub trait SnapshotStore: Send + Sync {
    fn read(&self, key: &str) -> std::io::Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> std::io::Result<()>;
    fn remove(&self, key: &str) -> std::io::Result<()>;
}

/// In-memory store. Clones share contents, which models several tabs of the
/// same browser profile sharing one local storage area.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.values.lock() {
            Ok(v) => v,
            Err(p) => p.into_inner(),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn read(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.values().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> std::io::Result<()> {
        self.values().remove(key);
        Ok(())
    }
}

/// Directory-backed store: one `<key>.json` file per key, written via a
/// temp file and rename so readers never see a half-written record.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn read(&self, key: &str) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: &str, value: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)
    }

    fn remove(&self, key: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `get`/`set`/`clear` of the single timer snapshot.
#[derive(Clone)]
pub struct LocalTimerCache {
    store: Arc<dyn SnapshotStore>,
    key: String,
}

impl LocalTimerCache {
    pub fn new(store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the snapshot. Corrupt or partial data is cleared and reported as
    /// `None`.
    pub fn get(&self) -> Option<LocalTimerSnapshot> {
        let raw = match self.store.read(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to read timer snapshot");
                return None;
            }
        };

        match decode_snapshot(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(key = %self.key, error = %e, "discarding corrupt timer snapshot");
                self.clear();
                None
            }
        }
    }

    /// Store `snapshot`, replacing any previous one.
    pub fn set(&self, snapshot: &LocalTimerSnapshot) {
        let json = match serde_json::to_string(snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %self.key, error = %e, "failed to encode timer snapshot");
                return;
            }
        };
        if let Err(e) = self.store.write(&self.key, &json) {
            warn!(key = %self.key, error = %e, "failed to write timer snapshot");
        } else {
            debug!(key = %self.key, entry_id = %snapshot.entry_id, "timer snapshot stored");
        }
    }

    /// Remove the snapshot.
    pub fn clear(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!(key = %self.key, error = %e, "failed to clear timer snapshot");
        }
    }
}

/// Decode a stored snapshot, checking required fields before the typed parse.
fn decode_snapshot(raw: &str) -> Result<LocalTimerSnapshot> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| SyncError::StorageCorruption(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| SyncError::StorageCorruption("snapshot is not an object".to_owned()))?;

    for field in REQUIRED_FIELDS {
        let present = match object.get(field) {
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Null) | None => false,
            Some(_) => true,
        };
        if !present {
            return Err(SyncError::StorageCorruption(format!(
                "missing required field `{field}`"
            )));
        }
    }

    serde_json::from_value(value)
        .map_err(|e| SyncError::StorageCorruption(format!("malformed snapshot: {e}")))
}
