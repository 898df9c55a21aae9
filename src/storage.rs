//! Persistence capabilities: an append-only event queue and a key-value store.
//!
//! The SDK only depends on the [`EventStore`] and [`KeyValueStore`] traits. In-memory and
//! directory-backed implementations are provided.
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{Error, Result};

/// A record read back from an [`EventStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Id assigned by the store on append. Ids increase with append order.
    pub id: u64,
    pub bytes: Vec<u8>,
}

/// Durable, order-preserving queue of serialized events.
///
/// Implementations must preserve append order across process restarts.
pub trait EventStore {
    /// Append a record, returning its id.
    fn append(&self, bytes: &[u8]) -> Result<u64>;
    /// Return up to `n` records, oldest first.
    fn peek_oldest(&self, n: usize) -> Result<Vec<StoredRecord>>;
    /// Remove a record. Removing an unknown id is not an error.
    fn remove(&self, id: u64) -> Result<()>;
    fn count(&self) -> Result<usize>;
}

/// Byte-oriented key-value persistence.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

fn persistence_error(err: io::Error) -> Error {
    Error::Persistence(Arc::new(err))
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_id: u64,
    records: BTreeMap<u64, Vec<u8>>,
}

/// [`EventStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    queue: Mutex<MemoryQueue>,
}

impl InMemoryEventStore {
    pub fn new() -> InMemoryEventStore {
        InMemoryEventStore::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let id = queue.next_id;
        queue.next_id += 1;
        queue.records.insert(id, bytes.to_vec());
        Ok(id)
    }

    fn peek_oldest(&self, n: usize) -> Result<Vec<StoredRecord>> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(queue
            .records
            .iter()
            .take(n)
            .map(|(id, bytes)| StoredRecord {
                id: *id,
                bytes: bytes.clone(),
            })
            .collect())
    }

    fn remove(&self, id: u64) -> Result<()> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.records.remove(&id);
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(queue.records.len())
    }
}

const RECORD_EXTENSION: &str = "event";

/// [`EventStore`] keeping one file per record in a directory.
///
/// File names are zero-padded record ids, so directory order is append order. Records are written
/// to a temporary file and renamed into place, so a crash never leaves a partial record behind.
#[derive(Debug)]
pub struct FileEventStore {
    dir: PathBuf,
    next_id: Mutex<u64>,
}

impl FileEventStore {
    /// Open (creating if needed) a store in `dir`. Records left by a previous process are kept.
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileEventStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(persistence_error)?;
        let next_id = record_ids(&dir)?.last().map_or(0, |id| id + 1);
        log::debug!(target: "splitkit",
                    dir:debug = dir,
                    next_id;
                    "opened event store");
        Ok(FileEventStore {
            dir,
            next_id: Mutex::new(next_id),
        })
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:020}.{RECORD_EXTENSION}"))
    }
}

/// Sorted ids of the records in `dir`.
fn record_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir).map_err(persistence_error)? {
        let path = entry.map_err(persistence_error)?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl EventStore for FileEventStore {
    fn append(&self, bytes: &[u8]) -> Result<u64> {
        let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next_id;
        write_atomically(&self.record_path(id), bytes).map_err(persistence_error)?;
        *next_id += 1;
        Ok(id)
    }

    fn peek_oldest(&self, n: usize) -> Result<Vec<StoredRecord>> {
        record_ids(&self.dir)?
            .into_iter()
            .take(n)
            .map(|id| {
                let bytes = fs::read(self.record_path(id)).map_err(persistence_error)?;
                Ok(StoredRecord { id, bytes })
            })
            .collect()
    }

    fn remove(&self, id: u64) -> Result<()> {
        match fs::remove_file(self.record_path(id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(persistence_error(err)),
            _ => Ok(()),
        }
    }

    fn count(&self) -> Result<usize> {
        Ok(record_ids(&self.dir)?.len())
    }
}

/// [`KeyValueStore`] that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> InMemoryKeyValueStore {
        InMemoryKeyValueStore::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// [`KeyValueStore`] keeping one file per key in a directory.
#[derive(Debug)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileKeyValueStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(persistence_error)?;
        Ok(FileKeyValueStore { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        // Keys are hex-encoded so that any key maps to a valid, unique file name.
        self.dir.join(format!("{}.value", hex::encode(key)))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(persistence_error(err)),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        write_atomically(&self.path(key), value).map_err(persistence_error)
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(persistence_error(err)),
            _ => Ok(()),
        }
    }
}
