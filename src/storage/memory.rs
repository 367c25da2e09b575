//! In-memory storage backend.
//!
//! Thread-safe implementation of [`Store`] over a single `RwLock`. It is used for
//! embedded deployments and tests, and as the materialized state behind the
//! persistent backend.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::conflict::{ConflictId, ConflictRecord, ConflictStatus};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType};
use crate::storage::traits::{ItemScan, Mutation, StorageError, Store, Transaction};
use crate::worker_state::WorkerKnowledgeState;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn timeout_err(context: &'static str, waited: Duration) -> StorageError {
    StorageError::Timeout {
        operation: context.to_string(),
        waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
    }
}

#[derive(Debug, Default)]
struct StoreState {
    items: HashMap<KnowledgeId, KnowledgeItem>,
    by_producer_type: HashMap<(String, KnowledgeType), BTreeMap<(DateTime<Utc>, u64), KnowledgeId>>,
    conflicts: HashMap<ConflictId, ConflictRecord>,
    by_type_status: HashMap<(KnowledgeType, ConflictStatus), BTreeSet<ConflictId>>,
    by_item: HashMap<KnowledgeId, Vec<ConflictId>>,
    workers: HashMap<String, WorkerKnowledgeState>,
    max_sequence: u64,
}

/// Thread-safe in-memory store.
#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    lock_timeout: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates an empty store whose lock waits are bounded by `timeout`.
    #[must_use]
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            lock_timeout: timeout,
        }
    }

    /// Number of stored items (any state).
    pub fn item_count(&self) -> Result<usize, StorageError> {
        Ok(self.read_state("store.item_count")?.items.len())
    }

    /// Number of stored conflict records.
    pub fn conflict_count(&self) -> Result<usize, StorageError> {
        Ok(self.read_state("store.conflict_count")?.conflicts.len())
    }

    /// Validates `tx`, runs `commit` while still holding the write lock, then applies.
    ///
    /// `commit` is where a durable backend appends its log record; if it fails the
    /// in-memory state is left untouched.
    pub(crate) fn apply_with<F>(&self, tx: Transaction, commit: F) -> Result<(), StorageError>
    where
        F: FnOnce(&Transaction) -> Result<(), StorageError>,
    {
        if tx.is_empty() {
            return Ok(());
        }
        let mut state = self.write_state("store.apply")?;
        check_transaction(&state, &tx)?;
        commit(&tx)?;
        for mutation in tx.mutations {
            apply_mutation(&mut state, mutation);
        }
        Ok(())
    }

    fn read_state(&self, context: &'static str) -> Result<RwLockReadGuard<'_, StoreState>, StorageError> {
        let start = Instant::now();
        loop {
            match self.state.try_read() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => return Err(lock_err(context)),
                Err(TryLockError::WouldBlock) => {
                    let waited = start.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(timeout_err(context, waited));
                    }
                    thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }

    fn write_state(&self, context: &'static str) -> Result<RwLockWriteGuard<'_, StoreState>, StorageError> {
        let start = Instant::now();
        loop {
            match self.state.try_write() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => return Err(lock_err(context)),
                Err(TryLockError::WouldBlock) => {
                    let waited = start.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(timeout_err(context, waited));
                    }
                    thread::sleep(Duration::from_micros(100));
                }
            }
        }
    }
}

/// Checks every mutation against current state plus the earlier mutations of the
/// same transaction. Nothing is written here.
fn check_transaction(state: &StoreState, tx: &Transaction) -> Result<(), StorageError> {
    let mut pending_items: HashMap<KnowledgeId, &KnowledgeItem> = HashMap::new();
    let mut pending_conflicts: HashSet<ConflictId> = HashSet::new();

    for mutation in &tx.mutations {
        match mutation {
            Mutation::InsertItem { item } => {
                if state.items.contains_key(&item.id) || pending_items.contains_key(&item.id) {
                    return Err(StorageError::DuplicateKey(item.id.to_string()));
                }
                if item.producer_id.is_empty() {
                    return Err(StorageError::InvariantViolation(format!(
                        "item {} has an empty producer id",
                        item.id
                    )));
                }
                check_lifecycle(item)?;
                pending_items.insert(item.id, item);
            }
            Mutation::UpdateItem { item } => {
                let current = pending_items
                    .get(&item.id)
                    .copied()
                    .or_else(|| state.items.get(&item.id))
                    .ok_or(StorageError::ItemNotFound(item.id))?;
                if !update_allowed(current, item) {
                    return Err(StorageError::InvariantViolation(format!(
                        "item {} update touches immutable fields",
                        item.id
                    )));
                }
                check_lifecycle(item)?;
                pending_items.insert(item.id, item);
            }
            Mutation::InsertConflict { record } => {
                if state.conflicts.contains_key(&record.id) || pending_conflicts.contains(&record.id) {
                    return Err(StorageError::DuplicateKey(record.id.to_string()));
                }
                check_conflict_items(state, &pending_items, record)?;
                pending_conflicts.insert(record.id);
            }
            Mutation::UpdateConflict { record } => {
                let existing = state.conflicts.get(&record.id);
                if existing.is_none() && !pending_conflicts.contains(&record.id) {
                    return Err(StorageError::ConflictNotFound(record.id));
                }
                if let Some(existing) = existing {
                    if existing.item_ids != record.item_ids {
                        return Err(StorageError::InvariantViolation(format!(
                            "conflict {} update changes its item set",
                            record.id
                        )));
                    }
                }
                check_conflict_items(state, &pending_items, record)?;
            }
            Mutation::TouchWorker { worker_id, .. } => {
                if worker_id.is_empty() {
                    return Err(StorageError::InvariantViolation(
                        "worker state requires a worker id".to_string(),
                    ));
                }
            }
        }
    }

    // Merge targets may be inserted anywhere in the same transaction.
    for item in pending_items.values() {
        if let Some(target) = item.merged_into {
            if target == item.id {
                return Err(StorageError::InvariantViolation(format!(
                    "item {} is merged into itself",
                    item.id
                )));
            }
            if !state.items.contains_key(&target) && !pending_items.contains_key(&target) {
                return Err(StorageError::ItemNotFound(target));
            }
        }
    }
    Ok(())
}

fn check_lifecycle(item: &KnowledgeItem) -> Result<(), StorageError> {
    if item.lifecycle_consistent() {
        Ok(())
    } else {
        Err(StorageError::InvariantViolation(format!(
            "item {} has state {} but merged_into {:?}",
            item.id, item.state, item.merged_into
        )))
    }
}

fn check_conflict_items(
    state: &StoreState,
    pending_items: &HashMap<KnowledgeId, &KnowledgeItem>,
    record: &ConflictRecord,
) -> Result<(), StorageError> {
    if record.item_ids.len() < 2 {
        return Err(StorageError::InvariantViolation(format!(
            "conflict {} references {} item(s), at least 2 required",
            record.id,
            record.item_ids.len()
        )));
    }
    for id in &record.item_ids {
        if !state.items.contains_key(id) && !pending_items.contains_key(id) {
            return Err(StorageError::ItemNotFound(*id));
        }
    }
    Ok(())
}

/// Identity fields never change. A merge product may also take a new payload,
/// urgency and priority when it absorbs later inputs, with `merged_from` only
/// growing.
fn update_allowed(current: &KnowledgeItem, next: &KnowledgeItem) -> bool {
    let same_identity = current.id == next.id
        && current.producer_id == next.producer_id
        && current.knowledge_type == next.knowledge_type
        && current.created_at == next.created_at
        && current.sequence == next.sequence;
    if !same_identity {
        return false;
    }
    if current.merged_from.is_empty() {
        current.payload == next.payload
            && current.urgency == next.urgency
            && current.priority == next.priority
            && next.merged_from.is_empty()
    } else {
        next.merged_from.starts_with(&current.merged_from)
    }
}

fn apply_mutation(state: &mut StoreState, mutation: Mutation) {
    match mutation {
        Mutation::InsertItem { item } => {
            state
                .by_producer_type
                .entry((item.producer_id.clone(), item.knowledge_type))
                .or_default()
                .insert((item.created_at, item.sequence), item.id);
            state.max_sequence = state.max_sequence.max(item.sequence);
            state.items.insert(item.id, item);
        }
        Mutation::UpdateItem { item } => {
            // Index keys are immutable fields, so only the record changes.
            state.items.insert(item.id, item);
        }
        Mutation::InsertConflict { record } => {
            for item_id in &record.item_ids {
                state.by_item.entry(*item_id).or_default().push(record.id);
            }
            state
                .by_type_status
                .entry((record.knowledge_type, record.status))
                .or_default()
                .insert(record.id);
            state.conflicts.insert(record.id, record);
        }
        Mutation::UpdateConflict { record } => {
            if let Some(old) = state.conflicts.get(&record.id) {
                let old_key = (old.knowledge_type, old.status);
                if let Some(set) = state.by_type_status.get_mut(&old_key) {
                    set.remove(&record.id);
                    if set.is_empty() {
                        state.by_type_status.remove(&old_key);
                    }
                }
            } else {
                for item_id in &record.item_ids {
                    state.by_item.entry(*item_id).or_default().push(record.id);
                }
            }
            state
                .by_type_status
                .entry((record.knowledge_type, record.status))
                .or_default()
                .insert(record.id);
            state.conflicts.insert(record.id, record);
        }
        Mutation::TouchWorker { worker_id, delta } => {
            state
                .workers
                .entry(worker_id.clone())
                .or_insert_with(|| WorkerKnowledgeState::new(worker_id, delta.at))
                .apply(&delta);
        }
    }
}

fn newest_first(a: &ConflictRecord, b: &ConflictRecord) -> std::cmp::Ordering {
    b.detected_at.cmp(&a.detected_at).then_with(|| a.id.cmp(&b.id))
}

impl Store for InMemoryStore {
    fn apply(&self, tx: Transaction) -> Result<(), StorageError> {
        self.apply_with(tx, |_| Ok(()))
    }

    fn get_item(&self, id: KnowledgeId) -> Result<Option<KnowledgeItem>, StorageError> {
        let state = self.read_state("item.get")?;
        Ok(state.items.get(&id).cloned())
    }

    fn get_items(&self, ids: &[KnowledgeId]) -> Result<Vec<KnowledgeItem>, StorageError> {
        let state = self.read_state("item.get_many")?;
        Ok(ids.iter().filter_map(|id| state.items.get(id).cloned()).collect())
    }

    fn find_by_producer_type(
        &self,
        producer_id: &str,
        knowledge_type: KnowledgeType,
        since: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeItem>, StorageError> {
        let state = self.read_state("item.find_by_producer_type")?;
        let Some(index) = state
            .by_producer_type
            .get(&(producer_id.to_string(), knowledge_type))
        else {
            return Ok(Vec::new());
        };
        Ok(index
            .range((since, 0)..)
            .filter_map(|(_, id)| state.items.get(id).cloned())
            .collect())
    }

    fn scan_items(&self, scan: &ItemScan) -> Result<Vec<KnowledgeItem>, StorageError> {
        let state = self.read_state("item.scan")?;
        let admits = |item: &KnowledgeItem| {
            (scan.include_inactive || item.is_active())
                && (scan.types.is_empty() || scan.types.contains(&item.knowledge_type))
                && scan.producer_id.as_ref().map_or(true, |p| *p == item.producer_id)
                && scan.created_since.map_or(true, |since| item.created_at >= since)
        };

        let mut out: Vec<KnowledgeItem> = match (&scan.producer_id, scan.types.is_empty()) {
            (Some(producer), false) => scan
                .types
                .iter()
                .filter_map(|t| state.by_producer_type.get(&(producer.clone(), *t)))
                .flat_map(BTreeMap::values)
                .filter_map(|id| state.items.get(id))
                .filter(|item| admits(item))
                .cloned()
                .collect(),
            _ => state.items.values().filter(|item| admits(item)).cloned().collect(),
        };
        out.sort_by_key(|item| item.sequence);
        Ok(out)
    }

    fn get_conflict(&self, id: ConflictId) -> Result<Option<ConflictRecord>, StorageError> {
        let state = self.read_state("conflict.get")?;
        Ok(state.conflicts.get(&id).cloned())
    }

    fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        let state = self.read_state("conflict.list")?;
        let mut out: Vec<ConflictRecord> = match status {
            Some(status) => KnowledgeType::ALL
                .iter()
                .filter_map(|t| state.by_type_status.get(&(*t, status)))
                .flatten()
                .filter_map(|id| state.conflicts.get(id).cloned())
                .collect(),
            None => state.conflicts.values().cloned().collect(),
        };
        out.sort_by(newest_first);
        out.truncate(limit);
        Ok(out)
    }

    fn conflicts_by_type_status(
        &self,
        knowledge_type: KnowledgeType,
        status: ConflictStatus,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        let state = self.read_state("conflict.by_type_status")?;
        let mut out: Vec<ConflictRecord> = state
            .by_type_status
            .get(&(knowledge_type, status))
            .into_iter()
            .flatten()
            .filter_map(|id| state.conflicts.get(id).cloned())
            .collect();
        out.sort_by(newest_first);
        Ok(out)
    }

    fn conflicts_for_item(&self, item: KnowledgeId) -> Result<Vec<ConflictRecord>, StorageError> {
        let state = self.read_state("conflict.for_item")?;
        let Some(ids) = state.by_item.get(&item) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| state.conflicts.get(id).cloned()).collect())
    }

    fn get_worker_state(&self, worker_id: &str) -> Result<Option<WorkerKnowledgeState>, StorageError> {
        let state = self.read_state("worker.get")?;
        Ok(state.workers.get(worker_id).cloned())
    }

    fn max_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.read_state("store.max_sequence")?.max_sequence)
    }
}
