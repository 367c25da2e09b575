//! Conflict resolution.
//!
//! Each resolution is one store transaction: item lifecycle changes and the
//! record update land together or not at all. At most one resolution per record
//! runs at a time; other callers wait and then observe the stored outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigError;
use crate::error::ResolutionError;
use crate::hub::Backoff;
use crate::knowledge::{ItemState, KnowledgeId, KnowledgeItem, Sequencer};
use crate::storage::{Store, Transaction};
use crate::time::Clock;

use super::types::{ConflictId, ConflictRecord, ConflictStatus, ResolutionDetail, ResolutionStrategy};

/// Reason recorded on items removed by the discard strategy.
pub const DISCARD_REASON: &str = "discarded: conflict";

/// Bound on `merged_into` hops followed when locating an input's live successor.
const MAX_MERGE_HOPS: usize = 64;

/// Resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Resolve new conflicts on the pipeline worker right after detection.
    pub auto_resolve: bool,
    /// Attempts per resolution when the store reports transient failures.
    pub max_attempts: u32,
    /// First retry delay.
    pub retry_base_ms: u64,
    /// Retry delay cap.
    pub retry_max_ms: u64,
    /// Bound on waiting for another in-flight resolution of the same record.
    pub in_flight_timeout_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_resolve: true,
            max_attempts: 3,
            retry_base_ms: 20,
            retry_max_ms: 500,
            in_flight_timeout_ms: 5000,
        }
    }
}

impl ResolverConfig {
    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("resolver.max_attempts", "must be > 0"));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::invalid(
                "resolver.retry_max_ms",
                "must be >= resolver.retry_base_ms",
            ));
        }
        if self.in_flight_timeout_ms == 0 {
            return Err(ConfigError::invalid("resolver.in_flight_timeout_ms", "must be > 0"));
        }
        Ok(())
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

/// Applies resolution strategies to conflict records.
pub struct ConflictResolver {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sequencer: Arc<Sequencer>,
    config: ResolverConfig,
    in_flight: Mutex<HashMap<ConflictId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConflictResolver {
    /// Creates a resolver.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sequencer: Arc<Sequencer>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            clock,
            sequencer,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolves a record with its own strategy or `strategy_override`.
    ///
    /// Resolving a `resolved` record returns it unchanged. `pendingManual` and
    /// `failed` records can be resolved again.
    ///
    /// # Errors
    /// - `ConflictNotFound` if no record has this id
    /// - `InFlightTimeout` if another resolution of the record holds it too long
    /// - any strategy failure, after the record has been marked `failed`
    pub fn resolve(
        &self,
        id: ConflictId,
        strategy_override: Option<ResolutionStrategy>,
    ) -> Result<ConflictRecord, ResolutionError> {
        let slot = self.slot(id);
        let result = match self.lock_slot(&slot, id) {
            Ok(_guard) => self.resolve_locked(id, strategy_override),
            Err(e) => Err(e),
        };
        self.release_slot(id, &slot);
        result
    }

    fn slot(&self, id: ConflictId) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(id).or_default())
    }

    fn lock_slot<'a>(
        &self,
        slot: &'a Mutex<()>,
        id: ConflictId,
    ) -> Result<MutexGuard<'a, ()>, ResolutionError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.in_flight_timeout_ms);
        loop {
            match slot.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(p)) => return Ok(p.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(ResolutionError::InFlightTimeout { conflict_id: id });
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn release_slot(&self, id: ConflictId, slot: &Arc<Mutex<()>>) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by this caller.
        if Arc::strong_count(slot) <= 2 {
            map.remove(&id);
        }
    }

    fn resolve_locked(
        &self,
        id: ConflictId,
        strategy_override: Option<ResolutionStrategy>,
    ) -> Result<ConflictRecord, ResolutionError> {
        let record = self
            .store
            .get_conflict(id)?
            .ok_or(ResolutionError::ConflictNotFound(id))?;
        if record.is_resolved() {
            return Ok(record);
        }

        let strategy = strategy_override.unwrap_or(record.strategy);
        if strategy == ResolutionStrategy::Manual && record.status == ConflictStatus::PendingManual {
            return Ok(record);
        }

        let mut backoff = self.config.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(&record, strategy) {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::debug!(conflict_id = %id, attempt, error = %e, ?delay, "retrying resolution");
                    thread::sleep(delay);
                }
                Err(e) => {
                    self.mark_failed(record, strategy, &e);
                    return Err(e);
                }
            }
        }
    }

    fn execute(
        &self,
        record: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictRecord, ResolutionError> {
        let mut updated = record.clone();
        updated.strategy = strategy;
        updated.attempts = record.attempts.saturating_add(1);

        if strategy == ResolutionStrategy::Manual {
            updated.status = ConflictStatus::PendingManual;
            updated.resolution_detail = Some(ResolutionDetail::AwaitingManual);
            self.store.apply(Transaction::new().update_conflict(updated.clone()))?;
            return Ok(updated);
        }

        let inputs = self.live_inputs(record)?;
        let (tx, detail) = if inputs.live.len() < 2 {
            (
                Transaction::new(),
                ResolutionDetail::Superseded {
                    remaining: inputs.live.iter().map(|i| i.id).collect(),
                },
            )
        } else {
            match strategy {
                ResolutionStrategy::Merge => self.merge(inputs),
                ResolutionStrategy::Prioritize => prioritize(inputs.live),
                ResolutionStrategy::Discard => discard(inputs.live),
                ResolutionStrategy::Manual => unreachable!("manual handled above"),
            }
        };

        updated.status = ConflictStatus::Resolved;
        updated.resolved_at = Some(self.clock.now());
        updated.resolution_detail = Some(detail);
        self.store.apply(tx.update_conflict(updated.clone()))?;

        tracing::info!(
            conflict_id = %record.id,
            %strategy,
            attempts = updated.attempts,
            "conflict resolved"
        );
        Ok(updated)
    }

    /// Live items behind the record: inputs that are active, or the active item
    /// an input was merged into. Deprecated inputs drop out.
    fn live_inputs(&self, record: &ConflictRecord) -> Result<LiveInputs, ResolutionError> {
        let missing = |item_id| ResolutionError::ItemMissing {
            conflict_id: record.id,
            item_id,
        };
        let mut seen = HashSet::new();
        let mut inputs = LiveInputs {
            live: Vec::with_capacity(record.item_ids.len()),
            reachable: Vec::with_capacity(record.item_ids.len()),
            successor: None,
        };
        for id in &record.item_ids {
            let mut current = self.store.get_item(*id)?.ok_or_else(|| missing(*id))?;
            for _ in 0..MAX_MERGE_HOPS {
                match (current.state, current.merged_into) {
                    (ItemState::Merged, Some(next)) => {
                        current = self.store.get_item(next)?.ok_or_else(|| missing(next))?;
                    }
                    _ => break,
                }
            }
            if !current.is_active() {
                continue;
            }
            inputs.reachable.push(*id);
            if current.id != *id && inputs.successor.is_none() {
                inputs.successor = Some(current.id);
            }
            if seen.insert(current.id) {
                inputs.live.push(current);
            }
        }
        Ok(inputs)
    }

    /// Folds the live inputs into one item.
    ///
    /// When an input was merged by an earlier resolution, the others are folded
    /// into that input's live successor, so all of the record's inputs share one
    /// `merged_into`. Otherwise a new item is created.
    fn merge(&self, inputs: LiveInputs) -> (Transaction, ResolutionDetail) {
        let LiveInputs {
            mut live,
            reachable,
            successor,
        } = inputs;

        let (target, tx) = match successor.and_then(|id| live.iter().position(|i| i.id == id)) {
            Some(pos) => {
                let mut head = live.remove(pos);
                absorb(&mut head, &live);
                (head.id, Transaction::new().update_item(head))
            }
            None => {
                let merged = self.merged_item(&live);
                (merged.id, Transaction::new().insert_item(merged))
            }
        };

        let tx = live.into_iter().fold(tx, |tx, mut item| {
            item.mark_merged(target);
            tx.update_item(item)
        });
        (
            tx,
            ResolutionDetail::Merged {
                merged_item_id: target,
                merged_from: reachable,
            },
        )
    }

    fn merged_item(&self, inputs: &[KnowledgeItem]) -> KnowledgeItem {
        let first = &inputs[0];
        KnowledgeItem {
            id: KnowledgeId::new(),
            producer_id: first.producer_id.clone(),
            knowledge_type: first.knowledge_type,
            payload: merged_payload(inputs),
            urgency: inputs.iter().map(|i| i.urgency).max().unwrap_or(first.urgency),
            priority: inputs.iter().map(|i| i.priority).max().unwrap_or(first.priority),
            created_at: inputs.iter().map(|i| i.created_at).max().unwrap_or(first.created_at),
            sequence: self.sequencer.next(),
            state: ItemState::Active,
            merged_into: None,
            deprecated_reason: None,
            merged_from: inputs.iter().map(|i| i.id).collect(),
        }
    }

    fn mark_failed(&self, mut record: ConflictRecord, strategy: ResolutionStrategy, error: &ResolutionError) {
        tracing::error!(conflict_id = %record.id, %strategy, %error, "conflict resolution failed");
        record.status = ConflictStatus::Failed;
        record.attempts = record.attempts.saturating_add(1);
        record.resolution_detail = Some(ResolutionDetail::Failed {
            error: error.to_string(),
            strategy,
        });
        if let Err(e) = self.store.apply(Transaction::new().update_conflict(record.clone())) {
            tracing::error!(conflict_id = %record.id, error = %e, "could not record resolution failure");
        }
    }
}

/// What a record resolves against.
struct LiveInputs {
    /// Live items, deduplicated, in record order.
    live: Vec<KnowledgeItem>,
    /// Record inputs whose chain ends at a live item.
    reachable: Vec<KnowledgeId>,
    /// Live successor of the first input that was already merged.
    successor: Option<KnowledgeId>,
}

/// Folds `others` into an existing merge product.
fn absorb(head: &mut KnowledgeItem, others: &[KnowledgeItem]) {
    let mut distinct: Vec<Value> = match &head.payload {
        Value::Array(values) if head.merged_from.len() > 1 => values.clone(),
        single => vec![single.clone()],
    };
    let before = distinct.len();
    for item in others {
        if !distinct.contains(&item.payload) {
            distinct.push(item.payload.clone());
        }
        if !head.merged_from.contains(&item.id) {
            head.merged_from.push(item.id);
        }
        head.urgency = head.urgency.max(item.urgency);
        head.priority = head.priority.max(item.priority);
    }
    if distinct.len() > before {
        head.payload = Value::Array(distinct);
    }
}

/// Identical payloads collapse to one; otherwise the distinct payloads in input order.
fn merged_payload(inputs: &[KnowledgeItem]) -> Value {
    let mut distinct: Vec<&Value> = Vec::new();
    for item in inputs {
        if !distinct.contains(&&item.payload) {
            distinct.push(&item.payload);
        }
    }
    match distinct.as_slice() {
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    }
}

fn prioritize(mut inputs: Vec<KnowledgeItem>) -> (Transaction, ResolutionDetail) {
    inputs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| b.sequence.cmp(&a.sequence))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut rest = inputs.into_iter();
    let Some(winner) = rest.next() else {
        return (Transaction::new(), ResolutionDetail::Superseded { remaining: Vec::new() });
    };
    let reason = format!("superseded by {}", winner.id);
    let mut deprecated_ids = Vec::new();
    let tx = rest.fold(Transaction::new(), |tx, mut item| {
        deprecated_ids.push(item.id);
        item.mark_deprecated(reason.clone());
        tx.update_item(item)
    });
    (
        tx,
        ResolutionDetail::Prioritized {
            winner_id: winner.id,
            deprecated_ids,
        },
    )
}

fn discard(inputs: Vec<KnowledgeItem>) -> (Transaction, ResolutionDetail) {
    let mut deprecated_ids = Vec::new();
    let tx = inputs.into_iter().fold(Transaction::new(), |tx, mut item| {
        deprecated_ids.push(item.id);
        item.mark_deprecated(DISCARD_REASON);
        tx.update_item(item)
    });
    (tx, ResolutionDetail::Discarded { deprecated_ids })
}
