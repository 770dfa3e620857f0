//! Global Storage
//!
//! The key/value store that installer modules use to pass state to each
//! other. One instance is created by the orchestrator and shared with every
//! module and job through an `Arc<GlobalStore>`.
//!
//! # Locking
//!
//! Entries live behind a reader/writer lock: any number of concurrent
//! readers, writers fully exclusive. Every mutating call takes the write
//! lock exactly once. Bulk loads merge through `merge_entries`, which
//! mutates the map directly instead of calling `insert` per key (that would
//! re-enter the lock and emit one notification per key).
//!
//! # Change notification
//!
//! `subscribe()` hands out a channel receiver. Each mutating call sends one
//! `StoreChanged` after the write lock is released; a bulk load sends one for
//! the whole batch. The subscriber list is locked before the write lock is
//! released, so notifications leave in the order the writes were applied.

use crate::error::StoreError;
use crate::value::{Mapping, StoredValue};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError, RwLock};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Largest file accepted by `load_json` / `load_yaml`.
pub const MAX_LOAD_SIZE: u64 = 1024 * 1024;

/// Payload-free change event; observers re-read what they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChanged;

/// Thread-safe mapping of string keys to `StoredValue`s.
#[derive(Debug, Default)]
pub struct GlobalStore {
    entries: RwLock<Mapping>,
    subscribers: Mutex<Vec<Sender<StoreChanged>>>,
}

impl GlobalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. The receiver gets one event per mutating call.
    pub fn subscribe(&self) -> Receiver<StoreChanged> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(|entries| entries.contains_key(key))
    }

    pub fn count(&self) -> usize {
        self.read(Mapping::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read(Mapping::is_empty)
    }

    /// All top-level keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.read(|entries| entries.keys().cloned().collect())
    }

    /// Value stored under `key`, or `StoredValue::Null` when absent.
    pub fn value(&self, key: &str) -> StoredValue {
        self.read(|entries| entries.get(key).cloned().unwrap_or_default())
    }

    /// Consistent copy of every entry, taken under a single read lock.
    pub fn snapshot(&self) -> Mapping {
        self.read(Mapping::clone)
    }

    /// Insert or overwrite `key`.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<StoredValue>) {
        let key = key.into();
        let value = value.into();
        self.write(move |entries| {
            entries.insert(key, value);
        });
    }

    /// Remove `key`, returning how many entries were removed (0 or 1).
    pub fn remove(&self, key: &str) -> usize {
        self.write(|entries| usize::from(entries.shift_remove(key).is_some()))
    }

    pub fn clear(&self) {
        self.write(Mapping::clear);
    }

    /// Resolve a dotted key such as `partition.efiSystemPartition`.
    ///
    /// A key without `.` is a plain top-level lookup. Otherwise the first
    /// segment names a top-level entry and each further segment must be a key
    /// inside a mapping. A missing segment or a non-mapping along the way
    /// yields `None`; no partial value is returned. Literal dots inside key
    /// names cannot be expressed.
    pub fn lookup(&self, dotted_key: &str) -> Option<StoredValue> {
        self.read(|entries| {
            let mut segments = dotted_key.split('.');
            let first = segments.next()?;
            let mut current = entries.get(first)?;
            for segment in segments {
                current = match current {
                    StoredValue::Mapping(map) => map.get(segment)?,
                    _ => return None,
                };
            }
            Some(current.clone())
        })
    }

    /// Log every entry at debug level.
    pub fn debug_dump(&self) {
        self.read(|entries| {
            debug!("GlobalStore {:p} holds {} item(s)", self, entries.len());
            for (key, value) in entries {
                debug!("  {}\t{}", key, value);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the whole store as one JSON document.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let document = self
            .read(serde_json::to_vec_pretty)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_atomically(path.as_ref(), &document)
    }

    /// Write the whole store as one YAML document.
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let document = self
            .read(serde_yaml::to_string)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_atomically(path.as_ref(), document.as_bytes())
    }

    /// Merge a JSON document into the store; returns the number of keys merged.
    pub fn load_json(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref();
        let content = read_capped(path)?;
        let document: StoredValue =
            serde_json::from_slice(&content).map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        self.merge_document(path, document)
    }

    /// Merge a YAML document into the store; returns the number of keys merged.
    pub fn load_yaml(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref();
        let content = read_capped(path)?;
        let document: StoredValue =
            serde_yaml::from_slice(&content).map_err(|source| StoreError::Yaml {
                path: path.to_path_buf(),
                source,
            })?;
        self.merge_document(path, document)
    }

    fn merge_document(&self, path: &Path, document: StoredValue) -> Result<usize, StoreError> {
        match document {
            StoredValue::Mapping(map) => Ok(self.merge_entries(map)),
            other => {
                warn!(
                    "{} holds a {} instead of a mapping, not loaded",
                    path.display(),
                    other.type_name()
                );
                Err(StoreError::NotAMapping {
                    path: path.to_path_buf(),
                })
            }
        }
    }

    /// Batch insert under one write lock with a single notification.
    ///
    /// Existing keys are overwritten. Must not call any public locking method.
    pub(crate) fn merge_entries(&self, batch: Mapping) -> usize {
        self.write(move |entries| {
            let merged = batch.len();
            entries.extend(batch);
            merged
        })
    }

    // ------------------------------------------------------------------------
    // Lock plumbing
    // ------------------------------------------------------------------------

    fn read<R>(&self, f: impl FnOnce(&Mapping) -> R) -> R {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f(&entries)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Mapping) -> R) -> R {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut entries);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(entries);
        subscribers.retain(|tx| tx.send(StoreChanged).is_ok());
        result
    }
}

/// Read at most `MAX_LOAD_SIZE` bytes, failing if the file is longer.
fn read_capped(path: &Path) -> Result<Vec<u8>, StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut content = Vec::new();
    file.take(MAX_LOAD_SIZE + 1)
        .read_to_end(&mut content)
        .map_err(io_err)?;
    if content.len() as u64 > MAX_LOAD_SIZE {
        warn!("{} is larger than {} bytes, not loaded", path.display(), MAX_LOAD_SIZE);
        return Err(StoreError::TooLarge {
            path: path.to_path_buf(),
            limit: MAX_LOAD_SIZE,
        });
    }
    Ok(content)
}

/// Write to a fresh sibling temporary file, then rename over `path`.
///
/// Every call gets its own temporary file, so concurrent saves to the same
/// path each publish a complete document.
fn write_atomically(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(content).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Dotted lookup against `store`; see [`GlobalStore::lookup`].
pub fn lookup(store: &GlobalStore, dotted_key: &str) -> Option<StoredValue> {
    store.lookup(dotted_key)
}
