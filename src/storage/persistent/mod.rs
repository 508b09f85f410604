//! File-backed event store.
//!
//! Durable, crash-tolerant storage for anchored events:
//! - an append-only log with CRC32-checksummed records
//! - replay on open to rebuild the in-memory hash index
//! - torn-tail recovery after a crash mid-append
//!
//! The graph itself is not persisted here; it belongs to the external graph
//! engine reached through [`crate::storage::GraphStore`]. A volatile graph
//! paired with this store must be rebuilt from [`FileEventStore::events_in_order`]
//! before new events are ingested (see [`crate::ingest::IngestionPipeline::restore`]).

mod codec;
mod log;

pub use log::{EventLog, LogRecord};

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::event::StoredEvent;
use crate::storage::traits::{EventStore, PutOutcome, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Default)]
struct Index {
    by_hash: HashMap<String, StoredEvent>,
    /// Hashes in append order.
    order: Vec<String>,
}

/// Event store persisted to a single append-only file.
pub struct FileEventStore {
    log: EventLog,
    index: RwLock<Index>,
}

impl FileEventStore {
    /// Opens or creates the log at `path` and replays it.
    ///
    /// # Errors
    /// I/O failures, or a file that is not an event log.
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let (log, records) = EventLog::open(path, sync_on_write)?;

        let mut index = Index::default();
        for record in records {
            if index.by_hash.contains_key(&record.event.hash) {
                continue;
            }
            index.order.push(record.event.hash.clone());
            index.by_hash.insert(record.event.hash.clone(), record.event);
        }
        tracing::info!(path = %path.display(), events = index.order.len(), "event log opened");

        Ok(Self {
            log,
            index: RwLock::new(index),
        })
    }

    /// Sequence number of the last appended record.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.log.current_sequence()
    }

    /// Every stored event, in the order it was first appended.
    ///
    /// # Errors
    /// A poisoned index lock.
    pub fn events_in_order(&self) -> Result<Vec<StoredEvent>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file_event.events_in_order"))?;
        Ok(index
            .order
            .iter()
            .filter_map(|hash| index.by_hash.get(hash).cloned())
            .collect())
    }
}

impl EventStore for FileEventStore {
    fn put(&self, event: StoredEvent) -> Result<PutOutcome, StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("file_event.put"))?;
        if index.by_hash.contains_key(&event.hash) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        self.log.append(event.clone())?;
        index.order.push(event.hash.clone());
        index.by_hash.insert(event.hash.clone(), event);
        Ok(PutOutcome::Inserted)
    }

    fn get(&self, hash: &str) -> Result<Option<StoredEvent>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file_event.get"))?;
        Ok(index.by_hash.get(hash).cloned())
    }

    fn contains(&self, hash: &str) -> Result<bool, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file_event.contains"))?;
        Ok(index.by_hash.contains_key(hash))
    }

    fn len(&self) -> Result<usize, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("file_event.len"))?;
        Ok(index.order.len())
    }
}
