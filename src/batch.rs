//! Publish batching.
//!
//! Items are buffered per `(producerId, type)` group and persisted one group at a
//! time, each flush being a single store transaction. A group is due once it
//! holds `batch_size` items or its oldest item has waited `flush_interval_ms`.
//!
//! All flushes run under one lock, so flush order within a group equals publish
//! order even when a failed flush puts its items back at the front.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::engine::PipelineStats;
use crate::error::{ExchangeError, ExchangeResult};
use crate::hub::Backoff;
use crate::knowledge::{KnowledgeItem, KnowledgeType};
use crate::storage::{StorageError, Store, Transaction};
use crate::time::Clock;
use crate::worker_state::WorkerDelta;

/// Batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per flush.
    pub batch_size: usize,
    /// Longest time an item waits before its group is flushed.
    pub flush_interval_ms: u64,
    /// Flusher wake-up period.
    pub tick_ms: u64,
    /// Store attempts per flush before the items are requeued.
    pub max_attempts: u32,
    /// First retry delay.
    pub retry_base_ms: u64,
    /// Retry delay cap.
    pub retry_max_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            flush_interval_ms: 500,
            tick_ms: 50,
            max_attempts: 5,
            retry_base_ms: 50,
            retry_max_ms: 2000,
        }
    }
}

impl BatchConfig {
    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch.batch_size", "must be > 0"));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::invalid("batch.flush_interval_ms", "must be > 0"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::invalid("batch.tick_ms", "must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("batch.max_attempts", "must be > 0"));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::invalid("batch.retry_max_ms", "must be >= batch.retry_base_ms"));
        }
        Ok(())
    }
}

/// A group of items that reached the store in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    /// Producer shared by the items.
    pub producer_id: String,
    /// Type shared by the items.
    pub knowledge_type: KnowledgeType,
    /// Items in publish order.
    pub items: Vec<KnowledgeItem>,
}

type GroupKey = (String, KnowledgeType);

#[derive(Debug)]
struct Pending {
    queued_at: Instant,
    item: KnowledgeItem,
}

#[derive(Debug)]
struct Chunk {
    key: GroupKey,
    entries: Vec<Pending>,
}

struct Shared {
    config: BatchConfig,
    groups: Mutex<HashMap<GroupKey, VecDeque<Pending>>>,
    flush_lock: Mutex<()>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    sink: Sender<FlushedBatch>,
    closed: AtomicBool,
}

/// Buffers publishes and flushes them in the background.
pub struct BatchAggregator {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BatchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchAggregator")
            .field("config", &self.shared.config)
            .field("closed", &self.shared.closed)
            .finish_non_exhaustive()
    }
}

impl BatchAggregator {
    /// Starts the flusher thread. Every successful flush is sent to `sink`.
    pub fn start(
        config: BatchConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
        sink: Sender<FlushedBatch>,
    ) -> ExchangeResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            groups: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
            store,
            clock,
            stats,
            sink,
            closed: AtomicBool::new(false),
        });

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("kyroql-exchange-flusher".to_string())
            .spawn(move || flusher_loop(&thread_shared, &wake_rx))
            .map_err(|e| ExchangeError::internal(format!("failed to spawn flusher: {e}")))?;

        Ok(Self {
            shared,
            wake_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Buffers one item. Never blocks on the store.
    pub fn enqueue(&self, item: KnowledgeItem) -> ExchangeResult<()> {
        let key = (item.producer_id.clone(), item.knowledge_type);
        let full = {
            let mut groups = self.shared.lock_groups();
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ExchangeError::internal("batch aggregator is shut down"));
            }
            let group = groups.entry(key).or_default();
            group.push_back(Pending {
                queued_at: Instant::now(),
                item,
            });
            group.len() >= self.shared.config.batch_size
        };
        if full {
            let _ = self.wake_tx.try_send(());
        }
        Ok(())
    }

    /// Flushes groups that are due; returns the number of successful flushes.
    pub fn flush_due(&self) -> usize {
        self.shared.flush_pass(false)
    }

    /// Flushes every buffered item regardless of size or age.
    pub fn flush_all(&self) -> usize {
        self.shared.flush_pass(true)
    }

    /// Items currently buffered.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.lock_groups().values().map(VecDeque::len).sum()
    }

    /// Stops accepting items, performs the final flush and joins the flusher.
    pub fn shutdown(&self) {
        {
            // Taken under the group lock so no enqueue lands after the final flush.
            let _groups = self.shared.lock_groups();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let _ = self.wake_tx.try_send(());
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("batch flusher panicked");
            }
        }
        let left = self.pending_len();
        if left > 0 {
            tracing::error!(items = left, "items still buffered after final flush");
        }
    }
}

impl Drop for BatchAggregator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flusher_loop(shared: &Shared, wake_rx: &Receiver<()>) {
    let tick = Duration::from_millis(shared.config.tick_ms);
    loop {
        select! {
            recv(wake_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
            }
            default(tick) => {}
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.flush_pass(false);
    }
    shared.flush_pass(true);
}

impl Shared {
    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashMap<GroupKey, VecDeque<Pending>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_due(&self, force: bool) -> Vec<Chunk> {
        let now = Instant::now();
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        let batch_size = self.config.batch_size;
        let mut groups = self.lock_groups();
        let mut out = Vec::new();
        for (key, group) in groups.iter_mut() {
            loop {
                let due = match group.front() {
                    None => false,
                    Some(oldest) => {
                        force || group.len() >= batch_size || now.duration_since(oldest.queued_at) >= interval
                    }
                };
                if !due {
                    break;
                }
                let n = group.len().min(batch_size);
                out.push(Chunk {
                    key: key.clone(),
                    entries: group.drain(..n).collect(),
                });
            }
        }
        groups.retain(|_, g| !g.is_empty());
        out
    }

    fn flush_pass(&self, force: bool) -> usize {
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut flushed = 0;
        let mut held: HashMap<GroupKey, Vec<Pending>> = HashMap::new();
        let mut blocked: HashSet<GroupKey> = HashSet::new();

        for chunk in self.take_due(force) {
            if blocked.contains(&chunk.key) {
                held.entry(chunk.key).or_default().extend(chunk.entries);
                continue;
            }
            match self.persist(&chunk) {
                Ok(()) => {
                    flushed += 1;
                    self.stats.record_flush(chunk.entries.len());
                    let batch = FlushedBatch {
                        producer_id: chunk.key.0,
                        knowledge_type: chunk.key.1,
                        items: chunk.entries.into_iter().map(|p| p.item).collect(),
                    };
                    if self.sink.send(batch).is_err() {
                        tracing::warn!("pipeline consumer is gone; flushed batch not processed");
                    }
                }
                Err(e) if e.is_transient() => {
                    self.stats.record_flush_failure();
                    tracing::warn!(
                        producer_id = %chunk.key.0,
                        knowledge_type = %chunk.key.1,
                        items = chunk.entries.len(),
                        error = %e,
                        "flush retries exhausted; items requeued"
                    );
                    blocked.insert(chunk.key.clone());
                    held.entry(chunk.key).or_default().extend(chunk.entries);
                }
                Err(e) => {
                    self.stats.record_flush_failure();
                    self.stats.record_items_dropped(chunk.entries.len());
                    tracing::error!(
                        producer_id = %chunk.key.0,
                        knowledge_type = %chunk.key.1,
                        items = chunk.entries.len(),
                        error = %e,
                        "flush rejected by store; items dropped"
                    );
                }
            }
        }

        if !held.is_empty() {
            let mut groups = self.lock_groups();
            for (key, entries) in held {
                let group = groups.entry(key).or_default();
                for entry in entries.into_iter().rev() {
                    group.push_front(entry);
                }
            }
        }
        flushed
    }

    fn persist(&self, chunk: &Chunk) -> Result<(), StorageError> {
        let delta = WorkerDelta::at(self.clock.now()).published(chunk.entries.len() as u64);
        let tx = chunk
            .entries
            .iter()
            .fold(Transaction::new(), |tx, p| tx.insert_item(p.item.clone()))
            .touch_worker(chunk.key.0.clone(), delta);

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.retry_base_ms),
            Duration::from_millis(self.config.retry_max_ms),
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.apply(tx.clone()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    self.stats.record_flush_retry();
                    let delay = backoff.next_delay();
                    tracing::debug!(attempt, error = %e, ?delay, "retrying flush");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
