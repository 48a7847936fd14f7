//! Persistent store for the barrier table
//!
//! The whole table is one document, loaded and saved atomically. Handles are
//! process-local and never persisted; only waiter ids and their lifecycle
//! state survive a restart.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::barrier::WaiterState;

/// Well-known file name of the persisted table
pub const STATE_FILE_NAME: &str = "rendezvous.json";

/// Advisory lock file guarding [`STATE_FILE_NAME`]
pub const LOCK_FILE_NAME: &str = "rendezvous.lock";

/// Current document format version
pub const DOCUMENT_VERSION: u32 = 1;

/// Persisted waiter slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedWaiter {
    pub state: WaiterState,
    pub entered_at: DateTime<Utc>,
}

/// Persisted rendezvous point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBarrier {
    pub quorum: u32,
    #[serde(default)]
    pub holding: BTreeMap<String, PersistedWaiter>,
}

/// The full barrier table as written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierDocument {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub barriers: BTreeMap<String, PersistedBarrier>,
}

impl BarrierDocument {
    pub fn new(barriers: BTreeMap<String, PersistedBarrier>) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            saved_at: Utc::now(),
            barriers,
        }
    }
}

impl Default for BarrierDocument {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// Durable load/save of the whole barrier table
///
/// Implementations must make `save` atomic at document granularity. They do
/// not need to serialize concurrent callers; the registry already does.
pub trait PersistentStore: Send + Sync {
    /// Load the table; `Ok(None)` when nothing was ever saved
    fn load(&self) -> Result<Option<BarrierDocument>>;

    /// Replace the stored table
    fn save(&self, document: &BarrierDocument) -> Result<()>;
}

/// JSON document on the local filesystem
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir`; the directory is created on first save
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(?dir, "JsonFileStore::new: called");
        Self { dir }
    }

    /// Path of the persisted document
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    fn lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir).context(format!("Failed to create state directory {}", self.dir.display()))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE_NAME))
            .context("Failed to open lock file")?;
        lock_file.lock_exclusive().context("Failed to lock state directory")?;
        Ok(lock_file)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(".rendezvous-{}.tmp", Uuid::now_v7()))
    }
}

impl PersistentStore for JsonFileStore {
    fn load(&self) -> Result<Option<BarrierDocument>> {
        let path = self.path();
        debug!(?path, "JsonFileStore::load: called");
        if !self.dir.is_dir() {
            debug!("JsonFileStore::load: no state directory yet");
            return Ok(None);
        }

        // Existence is decided under the lock so a concurrent first save is
        // either fully visible or not at all
        let lock = self.lock()?;
        let read = fs::read_to_string(&path);
        FileExt::unlock(&lock).ok();
        let content = match read {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("JsonFileStore::load: no document yet");
                return Ok(None);
            }
            Err(e) => return Err(e).context(format!("Failed to read {}", path.display())),
        };

        let document: BarrierDocument =
            serde_json::from_str(&content).context(format!("Failed to parse {}", path.display()))?;
        debug!(barriers = document.barriers.len(), "JsonFileStore::load: loaded");
        Ok(Some(document))
    }

    fn save(&self, document: &BarrierDocument) -> Result<()> {
        let path = self.path();
        debug!(?path, barriers = document.barriers.len(), "JsonFileStore::save: called");
        let content = serde_json::to_string_pretty(document)?;

        let lock = self.lock()?;
        let result = write_atomically(&self.temp_path(), &path, content.as_bytes());
        FileExt::unlock(&lock).ok();
        result
    }
}

/// Write to a sibling temp file, fsync, then rename over the target
fn write_atomically(temp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let write = || -> Result<()> {
        let mut temp_file = File::create(temp_path).context("Failed to create temp file")?;
        temp_file.write_all(bytes)?;
        temp_file.sync_all()?;
        drop(temp_file);
        fs::rename(temp_path, path).context(format!("Failed to replace {}", path.display()))?;
        Ok(())
    };

    let result = write();
    if result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(temp_path);
    }
    result
}

/// In-memory store holding the serialized document
///
/// Sharing one instance between two registries simulates a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw document text
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Mutex::new(Some(content.into())),
        }
    }

    /// Raw document text last saved
    pub fn content(&self) -> Option<String> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl PersistentStore for MemoryStore {
    fn load(&self) -> Result<Option<BarrierDocument>> {
        match self.content() {
            Some(content) => Ok(Some(serde_json::from_str(&content).context("Failed to parse document")?)),
            None => Ok(None),
        }
    }

    fn save(&self, document: &BarrierDocument) -> Result<()> {
        let content = serde_json::to_string(document)?;
        *self.content.lock().unwrap_or_else(PoisonError::into_inner) = Some(content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> BarrierDocument {
        let mut holding = BTreeMap::new();
        holding.insert(
            "n1".to_string(),
            PersistedWaiter {
                state: WaiterState::Held,
                entered_at: Utc::now(),
            },
        );
        let mut barriers = BTreeMap::new();
        barriers.insert("a".to_string(), PersistedBarrier { quorum: 2, holding });
        BarrierDocument::new(barriers)
    }

    #[test]
    fn test_missing_file_loads_none() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path().join("state"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_lock_without_document_loads_none() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path());
        store.save(&BarrierDocument::new(BTreeMap::new())).unwrap();
        fs::remove_file(store.path()).unwrap();

        assert!(temp.path().join(LOCK_FILE_NAME).exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path());
        let document = sample();

        store.save(&document).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, document);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path());
        store.save(&sample()).unwrap();
        store.save(&BarrierDocument::default()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(store.load().unwrap().unwrap().barriers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path());
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_document_format_is_readable() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path());
        store.save(&sample()).unwrap();

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], DOCUMENT_VERSION);
        assert_eq!(raw["barriers"]["a"]["quorum"], 2);
        assert_eq!(raw["barriers"]["a"]["holding"]["n1"]["state"], "held");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());

        let document = sample();
        store.save(&document).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), document);

        let corrupt = MemoryStore::with_content("garbage");
        assert!(corrupt.load().is_err());
    }
}
