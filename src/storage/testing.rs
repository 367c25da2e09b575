//! Store wrapper that injects write failures.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use crate::conflict::{ConflictId, ConflictRecord, ConflictStatus};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType};
use crate::worker_state::WorkerKnowledgeState;

use super::memory::InMemoryStore;
use super::traits::{ItemScan, Mutation, StorageError, Store, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// `Busy`, retryable.
    Transient,
    /// `BackendError`, not retryable.
    Permanent,
}

/// Fails the next `failures` matching `apply` calls, then delegates.
pub(crate) struct FaultyStore {
    pub(crate) inner: InMemoryStore,
    failures: AtomicU32,
    fault: Fault,
    only_item_updates: bool,
}

impl FaultyStore {
    pub(crate) fn new(failures: u32, fault: Fault) -> Self {
        Self {
            inner: InMemoryStore::new(),
            failures: AtomicU32::new(failures),
            fault,
            only_item_updates: false,
        }
    }

    /// Restricts failures to transactions that update existing items.
    pub(crate) fn only_item_updates(mut self) -> Self {
        self.only_item_updates = true;
        self
    }

    fn should_fail(&self, tx: &Transaction) -> bool {
        if self.only_item_updates
            && !tx
                .mutations
                .iter()
                .any(|m| matches!(m, Mutation::UpdateItem { .. }))
        {
            return false;
        }
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Store for FaultyStore {
    fn apply(&self, tx: Transaction) -> Result<(), StorageError> {
        if self.should_fail(&tx) {
            return Err(match self.fault {
                Fault::Transient => StorageError::Busy("injected".to_string()),
                Fault::Permanent => StorageError::BackendError("injected".to_string()),
            });
        }
        self.inner.apply(tx)
    }

    fn get_item(&self, id: KnowledgeId) -> Result<Option<KnowledgeItem>, StorageError> {
        self.inner.get_item(id)
    }

    fn find_by_producer_type(
        &self,
        producer_id: &str,
        knowledge_type: KnowledgeType,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeItem>, StorageError> {
        self.inner.find_by_producer_type(producer_id, knowledge_type, since)
    }

    fn scan_items(&self, scan: &ItemScan) -> Result<Vec<KnowledgeItem>, StorageError> {
        self.inner.scan_items(scan)
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictRecord>, StorageError> {
        self.inner.get_conflict(id)
    }

    fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        self.inner.list_conflicts(status, limit)
    }

    fn conflicts_by_type_status(
        &self,
        knowledge_type: KnowledgeType,
        status: ConflictStatus,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        self.inner.conflicts_by_type_status(knowledge_type, status)
    }

    fn conflicts_for_item(&self, item: KnowledgeId) -> Result<Vec<ConflictRecord>, StorageError> {
        self.inner.conflicts_for_item(item)
    }

    fn get_worker_state(&self, worker_id: &str) -> Result<Option<WorkerKnowledgeState>, StorageError> {
        self.inner.get_worker_state(worker_id)
    }

    fn max_sequence(&self) -> Result<u64, StorageError> {
        self.inner.max_sequence()
    }
}
