//! Local durable key/value storage.
//!
//! The offline queue must survive a restart, so it is written through a
//! [`LocalStore`] on every mutation. Values are opaque bytes; callers use
//! [`load_json`] / [`save_json`] for structured data.
//!
//! ```text
//! ┌──────────────┐  set_item/get_item  ┌──────────────────┐
//! │ DurableQueue │ ──────────────────► │ RocksLocalStore  │  LZ4 values
//! └──────────────┘                     │ MemoryLocalStore │  tests
//!                                      └──────────────────┘
//! ```

use rocksdb::{Options, WriteOptions, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum LocalStoreError {
    /// RocksDB internal error
    DatabaseError(String),
    CompressionError(String),
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for LocalStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalStoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            LocalStoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            LocalStoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            LocalStoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for LocalStoreError {}

impl From<rocksdb::Error> for LocalStoreError {
    fn from(e: rocksdb::Error) -> Self {
        LocalStoreError::DatabaseError(e.to_string())
    }
}

/// Synchronous key/value store local to this client.
pub trait LocalStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStoreError>;
    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), LocalStoreError>;
    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError>;
}

/// Read and decode a JSON value. `Ok(None)` when the key is absent.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &str,
) -> Result<Option<T>, LocalStoreError> {
    match store.get_item(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LocalStoreError::DeserializationError(e.to_string())),
        None => Ok(None),
    }
}

pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn LocalStore,
    key: &str,
    value: &T,
) -> Result<(), LocalStoreError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| LocalStoreError::SerializationError(e.to_string()))?;
    store.set_item(key, &bytes)
}

// ─── In-memory ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    items: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStoreError> {
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), LocalStoreError> {
        self.items().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError> {
        self.items().remove(key);
        Ok(())
    }
}

// ─── RocksDB ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync every write (default: true, the queue is small and must survive a crash)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hangout_local"),
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl LocalStoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

/// RocksDB-backed local store with LZ4-compressed values.
pub struct RocksLocalStore {
    db: DB,
    config: LocalStoreConfig,
}

impl RocksLocalStore {
    pub fn open(config: LocalStoreConfig) -> Result<Self, LocalStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_keep_log_file_num(2);
        let db = DB::open(&opts, &config.path)?;
        log::debug!("Opened local store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

impl LocalStore for RocksLocalStore {
    fn get_item(&self, key: &str) -> Result<Option<Vec<u8>>, LocalStoreError> {
        match self.db.get(key.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| LocalStoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &[u8]) -> Result<(), LocalStoreError> {
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db.put_opt(key.as_bytes(), compressed, &self.write_options())?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError> {
        self.db.delete_opt(key.as_bytes(), &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_memory_store_basics() {
        let store = MemoryLocalStore::new();
        assert_eq!(store.get_item("k").unwrap(), None);
        store.set_item("k", b"v").unwrap();
        assert_eq!(store.get_item("k").unwrap(), Some(b"v".to_vec()));
        store.remove_item("k").unwrap();
        assert_eq!(store.get_item("k").unwrap(), None);
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryLocalStore::new();
        let sample = Sample { name: "queue".into(), count: 3 };
        save_json(&store, "s", &sample).unwrap();
        let loaded: Option<Sample> = load_json(&store, "s").unwrap();
        assert_eq!(loaded, Some(sample));
        let missing: Option<Sample> = load_json(&store, "nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_json_corrupt_value() {
        let store = MemoryLocalStore::new();
        store.set_item("s", b"{not json").unwrap();
        let result: Result<Option<Sample>, _> = load_json(&store, "s");
        assert!(matches!(result, Err(LocalStoreError::DeserializationError(_))));
    }

    #[test]
    fn test_rocks_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksLocalStore::open(LocalStoreConfig::for_testing(dir.path())).unwrap();
        let value = "offline ".repeat(200);
        store.set_item("offline_queue", value.as_bytes()).unwrap();
        assert_eq!(store.get_item("offline_queue").unwrap(), Some(value.into_bytes()));
        store.remove_item("offline_queue").unwrap();
        assert_eq!(store.get_item("offline_queue").unwrap(), None);
    }

    #[test]
    fn test_rocks_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksLocalStore::open(LocalStoreConfig::for_testing(dir.path())).unwrap();
            save_json(&store, "s", &Sample { name: "a".into(), count: 1 }).unwrap();
        }
        let store = RocksLocalStore::open(LocalStoreConfig::for_testing(dir.path())).unwrap();
        let loaded: Option<Sample> = load_json(&store, "s").unwrap();
        assert_eq!(loaded, Some(Sample { name: "a".into(), count: 1 }));
    }

    #[test]
    fn test_error_display() {
        let err = LocalStoreError::CompressionError("bad".into());
        assert_eq!(err.to_string(), "Compression error: bad");
    }
}
