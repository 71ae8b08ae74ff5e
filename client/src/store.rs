//! Durable key-value storage.
//!
//! The engine persists three kinds of documents: mirrored tables
//! (`mirror/<table>`), the offline queue (`queue`) and the deriver's
//! processed keys (`derived/keys`). Any store that can get, set and delete a
//! string by key, and keep it across restarts, will do.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

/// Durable key for a mirrored table.
pub fn mirror_key(table: &str) -> String {
    format!("mirror/{}", table)
}

/// Durable key for the offline queue.
pub const QUEUE_KEY: &str = "queue";

/// Durable key for the deriver's processed idempotency keys.
pub const DERIVED_KEYS_KEY: &str = "derived/keys";

/// Error type for durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent key-value capability.
///
/// Calls are synchronous: documents are small and every write must be on
/// disk before the caller continues.
pub trait DurableStore: Send + Sync + std::fmt::Debug {
    /// Read a value.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;
}

/// File-backed store: one file per key under a root directory.
///
/// Writes go to a temporary file that is fsynced and then renamed over the
/// target, so a crash leaves either the old or the new document.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                '/' => '~',
                _ => '_',
            })
            .collect();
        self.root.join(format!("{}.json", name))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and for engines without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `set` and `delete` fail until turned off.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.get("queue").unwrap(), None);
        store.set("queue", "[1]").unwrap();
        store.set("queue", "[1,2]").unwrap();
        assert_eq!(store.get("queue").unwrap().as_deref(), Some("[1,2]"));

        store.delete("queue").unwrap();
        store.delete("queue").unwrap();
        assert_eq!(store.get("queue").unwrap(), None);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::open(dir.path())
            .unwrap()
            .set(&mirror_key("sales"), "{}")
            .unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get(&mirror_key("sales")).unwrap().as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn file_store_keys_do_not_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("../outside", "x").unwrap();
        let path = store.path_for("../outside");
        assert!(path.starts_with(dir.path()));
        assert_eq!(store.get("../outside").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn file_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set(QUEUE_KEY, "{}").unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["queue.json".to_string()]);
    }

    #[test]
    fn memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();

        store.fail_writes(true);
        assert!(matches!(store.set("b", "2"), Err(StoreError::Unavailable(_))));
        assert!(store.delete("a").is_err());
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        store.fail_writes(false);
        store.set("b", "2").unwrap();
        assert_eq!(store.len(), 2);
    }
}
