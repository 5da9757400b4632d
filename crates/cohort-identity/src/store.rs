//! Durable key-value storage behind the identity store.
//!
//! [`KeyValueStore`] is the storage port. [`RocksStore`] keeps identity in a
//! RocksDB directory so it survives process restarts the way browser local
//! storage survives page reloads; [`MemoryStore`] is the fallback when the
//! durable store cannot be opened, and the fake used by tests.

use crate::error::{Error, Result};
use rocksdb::{Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Key prefix for identity entries inside a shared RocksDB instance.
const KEY_PREFIX: &str = "identity:";

/// Storage port for string values keyed by fixed names.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when never stored.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// RocksDB-backed durable store.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(Self::key(key).as_bytes())? {
            Some(data) => String::from_utf8(data)
                .map(Some)
                .map_err(|e| Error::Storage(format!("non UTF-8 value under {key}: {e}"))),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.put(Self::key(key).as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.db.delete(Self::key(key).as_bytes())?;
        Ok(())
    }
}

/// In-memory store. Does not survive the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".into()))?;
        values.remove(key);
        Ok(())
    }
}

/// Handle to the identity's backing store.
///
/// Cheap to clone; all clones share one backend. `available()` is false when
/// the durable store could not be opened and values will not outlive the
/// process, which callers should surface to the participant.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KeyValueStore>,
    available: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open the durable store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = RocksStore::open(path)?;
        Ok(Self::with_backend(Arc::new(store), true))
    }

    /// Open the durable store, falling back to memory when it is unusable.
    pub fn open_or_fallback<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::open(path) {
            Ok(storage) => storage,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Durable store unavailable, identity will not survive a restart"
                );
                Self::with_backend(Arc::new(MemoryStore::new()), false)
            }
        }
    }

    /// Memory-backed storage that reports itself as available.
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryStore::new()), true)
    }

    /// Wrap an arbitrary backend.
    pub fn with_backend(backend: Arc<dyn KeyValueStore>, available: bool) -> Self {
        Self { backend, available }
    }

    /// Whether values persist beyond this process.
    pub fn available(&self) -> bool {
        self.available
    }

    /// Read a string value.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key)
    }

    /// Write a string value.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.set(key, value)
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key)
    }

    /// Read a JSON-encoded value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a value as JSON.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn rocks_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        store.set("worker_id", "W1").unwrap();
        assert_eq!(store.get("worker_id").unwrap().as_deref(), Some("W1"));

        store.remove("worker_id").unwrap();
        assert_eq!(store.get("worker_id").unwrap(), None);
    }

    #[test]
    fn rocks_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.set("participant_id", "42").unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert!(storage.available());
        assert_eq!(storage.get("participant_id").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn unstored_values_are_none() {
        let storage = Storage::memory();
        assert_eq!(storage.get("foo").unwrap(), None);
    }

    #[test]
    fn values_are_storable() {
        let storage = Storage::memory();
        storage.set("foo", "bar").unwrap();
        assert_eq!(storage.get("foo").unwrap().as_deref(), Some("bar"));
    }

    #[test]
    fn json_values() {
        let storage = Storage::memory();
        let mut map = BTreeMap::new();
        map.insert("key".to_string(), "value".to_string());
        storage.set_json("entry_information", &map).unwrap();

        let loaded: BTreeMap<String, String> =
            storage.get_json("entry_information").unwrap().unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn fallback_when_path_unusable() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"occupied").unwrap();

        let storage = Storage::open_or_fallback(&file);
        assert!(!storage.available());

        storage.set("mode", "debug").unwrap();
        assert_eq!(storage.get("mode").unwrap().as_deref(), Some("debug"));
    }
}
