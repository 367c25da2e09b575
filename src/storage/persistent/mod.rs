//! Durable storage backend.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               PersistentStore                │
//! ├──────────────────────────────────────────────┤
//! │  apply(tx) ─► validate ─► WAL append ─► apply│
//! │                 │                        │   │
//! │                 └──── InMemoryStore ◄────┘   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Reads are served from the in-memory state. On open the log is replayed
//! transaction by transaction; a torn tail is truncated.

mod codec;
mod wal;

pub use wal::{Recovery, WalEntry, WriteAheadLog};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::{ConflictId, ConflictRecord, ConflictStatus};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType};
use crate::storage::memory::{InMemoryStore, DEFAULT_LOCK_TIMEOUT};
use crate::storage::traits::{ItemScan, StorageError, Store, Transaction};
use crate::worker_state::WorkerKnowledgeState;

/// Log file name inside the data directory.
pub const WAL_FILE_NAME: &str = "exchange.wal";

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentConfig {
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
    /// Bound on waiting for the store lock, in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            lock_timeout_ms: u64::try_from(DEFAULT_LOCK_TIMEOUT.as_millis()).unwrap_or(2000),
        }
    }
}

fn io_err(context: &str, e: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {e}"))
}

/// WAL-backed [`Store`].
#[derive(Debug)]
pub struct PersistentStore {
    dir: PathBuf,
    memory: InMemoryStore,
    wal: WriteAheadLog,
}

impl PersistentStore {
    /// Opens or creates a store in `dir`, replaying any existing log.
    ///
    /// # Errors
    /// - If the directory cannot be created or the log cannot be opened
    /// - If a logged transaction fails validation on replay
    pub fn open(dir: impl AsRef<Path>, config: &PersistentConfig) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_err("create data directory", &e))?;

        let (wal, recovery) = WriteAheadLog::open(&dir.join(WAL_FILE_NAME), config.sync_on_write)
            .map_err(|e| io_err("open write-ahead log", &e))?;

        let memory = InMemoryStore::with_lock_timeout(Duration::from_millis(config.lock_timeout_ms));
        let replayed = recovery.entries.len();
        for entry in recovery.entries {
            let sequence = entry.sequence;
            memory.apply(entry.tx).map_err(|e| {
                StorageError::BackendError(format!("replay of log entry {sequence} failed: {e}"))
            })?;
        }

        tracing::info!(
            dir = %dir.display(),
            replayed,
            truncated_bytes = recovery.truncated_bytes,
            "persistent store opened"
        );
        Ok(Self { dir, memory, wal })
    }

    /// Data directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of stored items (any state).
    pub fn item_count(&self) -> Result<usize, StorageError> {
        self.memory.item_count()
    }

    /// Log size in bytes.
    pub fn wal_size_bytes(&self) -> Result<u64, StorageError> {
        self.wal.size_bytes().map_err(|e| io_err("stat write-ahead log", &e))
    }
}

impl Store for PersistentStore {
    fn apply(&self, tx: Transaction) -> Result<(), StorageError> {
        self.memory.apply_with(tx, |tx| {
            self.wal
                .append(tx)
                .map(|_| ())
                .map_err(|e| io_err("append to write-ahead log", &e))
        })
    }

    fn get_item(&self, id: KnowledgeId) -> Result<Option<KnowledgeItem>, StorageError> {
        self.memory.get_item(id)
    }

    fn get_items(&self, ids: &[KnowledgeId]) -> Result<Vec<KnowledgeItem>, StorageError> {
        self.memory.get_items(ids)
    }

    fn find_by_producer_type(
        &self,
        producer_id: &str,
        knowledge_type: KnowledgeType,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeItem>, StorageError> {
        self.memory.find_by_producer_type(producer_id, knowledge_type, since)
    }

    fn scan_items(&self, scan: &ItemScan) -> Result<Vec<KnowledgeItem>, StorageError> {
        self.memory.scan_items(scan)
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictRecord>, StorageError> {
        self.memory.get_conflict(id)
    }

    fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        self.memory.list_conflicts(status, limit)
    }

    fn conflicts_by_type_status(
        &self,
        knowledge_type: KnowledgeType,
        status: ConflictStatus,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        self.memory.conflicts_by_type_status(knowledge_type, status)
    }

    fn conflicts_for_item(&self, item: KnowledgeId) -> Result<Vec<ConflictRecord>, StorageError> {
        self.memory.conflicts_for_item(item)
    }

    fn get_worker_state(&self, worker_id: &str) -> Result<Option<WorkerKnowledgeState>, StorageError> {
        self.memory.get_worker_state(worker_id)
    }

    fn max_sequence(&self) -> Result<u64, StorageError> {
        self.memory.max_sequence()
    }
}
