//! The consumer side of the publish channel.
//!
//! Every flushed batch is handled in three steps on one worker thread:
//! notify subscribers, detect conflicts for every item of the batch, then
//! (when enabled) resolve the conflicts that batch produced.
//!
//! Conflicts whose write keeps failing with a transient store error are held
//! by the worker and written again with backoff; the items they reference are
//! already persisted and are never re-detected.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::batch::FlushedBatch;
use crate::cache::QueryCache;
use crate::conflict::{ConflictDetector, ConflictId, ConflictRecord, ConflictResolver, ConflictStatus, ResolutionStrategy};
use crate::error::{ExchangeError, ExchangeResult, ResolutionError};
use crate::hub::{Backoff, NotificationEvent, NotificationHub, PublishedBatch};
use crate::storage::{StorageError, Store, Transaction};
use crate::time::Clock;
use crate::worker_state::WorkerDelta;

use super::stats::PipelineStats;

/// Attempts at persisting the conflicts of one batch before they are deferred.
const CONFLICT_WRITE_ATTEMPTS: u32 = 3;

/// How often the worker looks at deferred conflict writes when idle.
const DEFERRED_TICK: Duration = Duration::from_millis(50);

/// Detected conflicts waiting for the store to accept them.
pub(crate) struct Deferred {
    records: Vec<ConflictRecord>,
    due: Instant,
    backoff: Backoff,
}

/// Everything the pipeline worker touches.
pub(crate) struct Pipeline {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) detector: ConflictDetector,
    pub(crate) resolver: ConflictResolver,
    pub(crate) hub: Arc<NotificationHub>,
    pub(crate) cache: Arc<QueryCache>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) deferred: Mutex<VecDeque<Deferred>>,
}

impl Pipeline {
    /// Handles one flushed batch.
    pub(crate) fn process(&self, batch: FlushedBatch) {
        let now = self.clock.now();
        self.cache.invalidate_types(&[batch.knowledge_type]);

        let published = PublishedBatch {
            producer_id: batch.producer_id.clone(),
            knowledge_type: batch.knowledge_type,
            item_ids: batch.items.iter().map(|i| i.id).collect(),
        };
        self.hub.broadcast(
            &NotificationEvent::knowledge_published(&published, now),
            Some(&batch.producer_id),
        );

        let detected = self.detect_all(&batch);
        if !detected.is_empty() {
            self.record_detected(detected, None);
        }
    }

    fn write_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(20), Duration::from_millis(500))
    }

    fn deferred_queue(&self) -> MutexGuard<'_, VecDeque<Deferred>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists new records, then announces and (optionally) resolves them.
    fn record_detected(&self, records: Vec<ConflictRecord>, backoff: Option<Backoff>) {
        match self.persist_conflicts(&records) {
            Ok(()) => self.announce(&records),
            Err(e) if e.is_transient() => {
                let mut backoff = backoff.unwrap_or_else(Self::write_backoff);
                let delay = backoff.next_delay();
                self.stats.record_conflict_write_retry();
                tracing::warn!(
                    conflicts = records.len(),
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "conflict write deferred"
                );
                self.deferred_queue().push_back(Deferred {
                    records,
                    due: Instant::now() + delay,
                    backoff,
                });
            }
            Err(e) => {
                self.stats.record_detection_error();
                tracing::error!(conflicts = records.len(), error = %e, "failed to record detected conflicts");
            }
        }
    }

    fn announce(&self, records: &[ConflictRecord]) {
        self.stats.record_conflicts_detected(records.len());
        for record in records {
            self.hub
                .broadcast(&NotificationEvent::conflict_detected(record, self.clock.now()), None);
        }

        if self.resolver.config().auto_resolve {
            for record in records {
                // Failures are recorded on the conflict and already logged.
                let _ = self.resolve(record.id, None);
            }
        }
    }

    /// Writes deferred conflicts that are due (all of them when `force`).
    ///
    /// Returns how many deferred writes are still waiting.
    pub(crate) fn retry_deferred(&self, force: bool) -> usize {
        let ready: Vec<Deferred> = {
            let mut queue = self.deferred_queue();
            if force {
                queue.drain(..).collect()
            } else {
                let now = Instant::now();
                let (ready, waiting): (Vec<_>, Vec<_>) = queue.drain(..).partition(|d| d.due <= now);
                queue.extend(waiting);
                ready
            }
        };
        for deferred in ready {
            self.record_detected(deferred.records, Some(deferred.backoff));
        }
        self.deferred_len()
    }

    /// Deferred conflict writes.
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred_queue().len()
    }

    fn detect_all(&self, batch: &FlushedBatch) -> Vec<ConflictRecord> {
        let now = self.clock.now();
        let mut out = Vec::new();
        for item in &batch.items {
            match self.detector.detect(self.store.as_ref(), item, now) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(e) => {
                    self.stats.record_detection_error();
                    tracing::warn!(item_id = %item.id, error = %e, "conflict detection failed");
                }
            }
        }
        out
    }

    /// Writes new records and bumps `conflictsInvolved` for their producers.
    fn persist_conflicts(&self, records: &[ConflictRecord]) -> Result<(), StorageError> {
        let mut involvement: BTreeMap<String, u64> = BTreeMap::new();
        for record in records {
            for item in self.store.get_items(&record.item_ids)? {
                *involvement.entry(item.producer_id).or_default() += 1;
            }
        }

        let now = self.clock.now();
        let mut tx = records
            .iter()
            .fold(Transaction::new(), |tx, r| tx.insert_conflict(r.clone()));
        for (worker, n) in involvement {
            tx = tx.touch_worker(worker, WorkerDelta::at(now).conflicts(n));
        }

        let mut backoff = Self::write_backoff();
        let mut attempt = 1;
        loop {
            match self.store.apply(tx.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < CONFLICT_WRITE_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(backoff.next_delay());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolves a record and tells subscribers about the outcome.
    pub(crate) fn resolve(
        &self,
        id: ConflictId,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<ConflictRecord, ResolutionError> {
        let before = self.store.get_conflict(id)?.map(|r| r.status);
        match self.resolver.resolve(id, strategy) {
            Ok(record) => {
                if before != Some(record.status) {
                    if record.status == ConflictStatus::Resolved {
                        self.stats.record_resolution(true);
                    }
                    self.after_resolution(&record);
                }
                Ok(record)
            }
            Err(e) => {
                if !matches!(e, ResolutionError::ConflictNotFound(_) | ResolutionError::InFlightTimeout { .. }) {
                    self.stats.record_resolution(false);
                    if let Ok(Some(record)) = self.store.get_conflict(id) {
                        self.after_resolution(&record);
                    }
                }
                Err(e)
            }
        }
    }

    fn after_resolution(&self, record: &ConflictRecord) {
        self.cache.invalidate_types(&[record.knowledge_type]);
        self.hub
            .broadcast(&NotificationEvent::conflict_resolved(record, self.clock.now()), None);
    }
}

enum Control {
    Barrier(Sender<()>),
    Stop,
}

/// The thread that drains the publish channel.
pub(crate) struct PipelineWorker {
    control_tx: Sender<Control>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PipelineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineWorker").finish_non_exhaustive()
    }
}

impl PipelineWorker {
    pub(crate) fn spawn(pipeline: Arc<Pipeline>, batches: Receiver<FlushedBatch>) -> ExchangeResult<Self> {
        let (control_tx, control_rx) = bounded::<Control>(16);
        let join = thread::Builder::new()
            .name("kyroql-exchange-pipeline".to_string())
            .spawn(move || worker_loop(&pipeline, &batches, &control_rx))
            .map_err(|e| ExchangeError::internal(format!("failed to spawn pipeline worker: {e}")))?;
        Ok(Self {
            control_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Waits until every batch queued before the call has been processed.
    pub(crate) fn barrier(&self, timeout: Duration) -> bool {
        let (reply_tx, reply_rx) = bounded(1);
        if self.control_tx.send_timeout(Control::Barrier(reply_tx), timeout).is_err() {
            return false;
        }
        reply_rx.recv_timeout(timeout).is_ok()
    }

    /// Processes what is queued, then stops the thread. Idempotent.
    pub(crate) fn stop(&self) {
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = self.control_tx.send(Control::Stop);
            if handle.join().is_err() {
                tracing::error!("pipeline worker panicked");
            }
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(pipeline: &Pipeline, batches: &Receiver<FlushedBatch>, control: &Receiver<Control>) {
    let drain = || {
        for batch in batches.try_iter() {
            pipeline.process(batch);
        }
        pipeline.retry_deferred(true)
    };
    loop {
        select! {
            recv(batches) -> msg => match msg {
                Ok(batch) => {
                    pipeline.process(batch);
                    pipeline.retry_deferred(false);
                }
                Err(_) => break,
            },
            recv(control) -> msg => match msg {
                Ok(Control::Barrier(reply)) => {
                    drain();
                    let _ = reply.send(());
                }
                Ok(Control::Stop) | Err(_) => {
                    let left = drain();
                    if left > 0 {
                        tracing::error!(deferred = left, "pipeline stopped with unwritten conflicts");
                    }
                    break;
                }
            },
            default(DEFERRED_TICK) => {
                pipeline.retry_deferred(false);
            }
        }
    }
    tracing::debug!("pipeline worker stopped");
}
