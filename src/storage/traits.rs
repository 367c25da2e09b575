//! Abstract storage contract.
//!
//! The store is the only component with durable state. It holds three logical
//! collections (`knowledge_items`, `conflicts`, `worker_state`) and applies
//! writes as all-or-nothing [`Transaction`]s so that partial merges or partial
//! batch flushes are never observable.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conflict::{ConflictId, ConflictRecord, ConflictStatus};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType};
use crate::worker_state::{WorkerDelta, WorkerKnowledgeState};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Knowledge item not found.
    #[error("Knowledge item not found: {0}")]
    ItemNotFound(KnowledgeId),

    /// Conflict not found.
    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A mutation would break a record invariant.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The operation did not complete within its deadline.
    #[error("Storage operation '{operation}' timed out after {waited_ms}ms")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Time spent waiting.
        waited_ms: u64,
    },

    /// The backend is temporarily refusing writes.
    #[error("Storage backend busy: {0}")]
    Busy(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageError {
    /// Returns true if retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Busy(_))
    }
}

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Insert a new knowledge item.
    InsertItem {
        /// The item.
        item: KnowledgeItem,
    },
    /// Replace an item's lifecycle fields.
    UpdateItem {
        /// The item with its new lifecycle state.
        item: KnowledgeItem,
    },
    /// Insert a new conflict record.
    InsertConflict {
        /// The record.
        record: ConflictRecord,
    },
    /// Replace a conflict record.
    UpdateConflict {
        /// The record.
        record: ConflictRecord,
    },
    /// Create or update a worker's counters.
    TouchWorker {
        /// Worker identity.
        worker_id: String,
        /// Counter change.
        delta: WorkerDelta,
    },
}

/// An ordered list of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Mutations in application order.
    pub mutations: Vec<Mutation>,
}

impl Transaction {
    /// An empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an item insert.
    #[must_use]
    pub fn insert_item(mut self, item: KnowledgeItem) -> Self {
        self.mutations.push(Mutation::InsertItem { item });
        self
    }

    /// Appends an item update.
    #[must_use]
    pub fn update_item(mut self, item: KnowledgeItem) -> Self {
        self.mutations.push(Mutation::UpdateItem { item });
        self
    }

    /// Appends a conflict insert.
    #[must_use]
    pub fn insert_conflict(mut self, record: ConflictRecord) -> Self {
        self.mutations.push(Mutation::InsertConflict { record });
        self
    }

    /// Appends a conflict update.
    #[must_use]
    pub fn update_conflict(mut self, record: ConflictRecord) -> Self {
        self.mutations.push(Mutation::UpdateConflict { record });
        self
    }

    /// Appends a worker counter change.
    #[must_use]
    pub fn touch_worker(mut self, worker_id: impl Into<String>, delta: WorkerDelta) -> Self {
        self.mutations.push(Mutation::TouchWorker {
            worker_id: worker_id.into(),
            delta,
        });
        self
    }

    /// Returns true if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Number of mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// Selection over the `knowledge_items` collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemScan {
    /// Exact producer.
    pub producer_id: Option<String>,
    /// Accepted types (empty = all).
    pub types: BTreeSet<KnowledgeType>,
    /// Inclusive lower bound on `created_at`.
    pub created_since: Option<DateTime<Utc>>,
    /// Include merged and deprecated items.
    pub include_inactive: bool,
}

/// Storage contract for the exchange.
///
/// # Safety Considerations
/// - `apply` must be atomic: either every mutation is visible or none is
/// - Implementations must handle concurrent readers and writers safely
/// - Blocking on contention must be bounded; exceeding the bound yields
///   [`StorageError::Timeout`]
pub trait Store: Send + Sync {
    /// Validates and applies a transaction atomically.
    fn apply(&self, tx: Transaction) -> Result<(), StorageError>;

    /// Get an item by ID.
    fn get_item(&self, id: KnowledgeId) -> Result<Option<KnowledgeItem>, StorageError>;

    /// Get several items, skipping unknown ids, in request order.
    fn get_items(&self, ids: &[KnowledgeId]) -> Result<Vec<KnowledgeItem>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get_item(*id)? {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Items of one producer and type created at or after `since`, oldest first.
    ///
    /// Served by the `(producerId, type, createdAt)` index; includes inactive items.
    fn find_by_producer_type(
        &self,
        producer_id: &str,
        knowledge_type: KnowledgeType,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeItem>, StorageError>;

    /// Items matching a scan.
    fn scan_items(&self, scan: &ItemScan) -> Result<Vec<KnowledgeItem>, StorageError>;

    /// Get a conflict record by ID.
    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictRecord>, StorageError>;

    /// Conflict records, newest first, optionally restricted to one status.
    fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StorageError>;

    /// Records of one type and status, served by the `(type, status)` index.
    fn conflicts_by_type_status(
        &self,
        knowledge_type: KnowledgeType,
        status: ConflictStatus,
    ) -> Result<Vec<ConflictRecord>, StorageError>;

    /// Records that involve `item`.
    fn conflicts_for_item(&self, item: KnowledgeId) -> Result<Vec<ConflictRecord>, StorageError>;

    /// Counters for one worker.
    fn get_worker_state(&self, worker_id: &str) -> Result<Option<WorkerKnowledgeState>, StorageError>;

    /// Highest publish sequence stored so far (0 when empty).
    fn max_sequence(&self) -> Result<u64, StorageError>;
}
