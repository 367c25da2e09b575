//! The exchange runtime.
//!
//! [`Exchange`] builds every component once and wires them together:
//!
//! ```text
//! publish -> KnowledgeRouter -> BatchAggregator -(flush)-> Store
//!                                      |
//!                                      v  FlushedBatch channel
//!                               pipeline worker: notify, detect, resolve
//! ```
//!
//! Background threads: the batch flusher, the pipeline worker, the hub
//! heartbeat sweep and the cache expiry sweep. [`Exchange::shutdown`] stops them
//! in that order so the final flush is fully processed.

mod background;
mod pipeline;
mod router;
mod stats;

pub use router::{KnowledgeRouter, RouterConfig};
pub use stats::{PipelineSnapshot, PipelineStats};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};

use crate::batch::BatchAggregator;
use crate::cache::{CacheStats, QueryCache};
use crate::config::ExchangeConfig;
use crate::conflict::{ConflictDetector, ConflictId, ConflictRecord, ConflictResolver, ConflictStatus, ResolutionStrategy};
use crate::error::{DeliveryError, ExchangeError, ExchangeResult, ValidationError};
use crate::freshness::FreshnessModel;
use crate::hub::{HubStats, NotificationHub, Subscription};
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType, NewKnowledge, Sequencer};
use crate::query::{QueryFilter, MAX_QUERY_LIMIT};
use crate::receive::{HandlerRegistry, KnowledgeReceiver};
use crate::storage::{StorageError, Store, Transaction};
use crate::time::{system_clock, Clock};
use crate::worker_state::{WorkerDelta, WorkerKnowledgeState};

use background::PeriodicTask;
use pipeline::{Pipeline, PipelineWorker};

/// Bound on waiting for the pipeline to catch up in [`Exchange::flush`].
const FLUSH_WAIT: Duration = Duration::from_secs(30);

/// Snapshot served by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// False once shutdown has begun.
    pub accepting: bool,
    /// Items accepted but not yet flushed.
    pub pending_items: usize,
    /// Detected conflicts waiting for the store to accept them.
    pub deferred_conflicts: usize,
    /// Pipeline counters.
    pub pipeline: PipelineSnapshot,
    /// Connection registry counters.
    pub hub: HubStats,
    /// Query cache counters.
    pub cache: CacheStats,
}

/// A running knowledge exchange.
pub struct Exchange {
    config: ExchangeConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    router: KnowledgeRouter,
    pipeline: Arc<Pipeline>,
    worker: PipelineWorker,
    hub: Arc<NotificationHub>,
    cache: Arc<QueryCache>,
    stats: Arc<PipelineStats>,
    tasks: Vec<PeriodicTask>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("router", &self.router)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Exchange {
    /// Starts an exchange over `store` using the system clock.
    pub fn start(config: ExchangeConfig, store: Arc<dyn Store>) -> ExchangeResult<Self> {
        Self::with_clock(config, store, system_clock())
    }

    /// Starts an exchange with an explicit clock.
    ///
    /// # Errors
    /// Invalid configuration, a store that cannot report its last sequence, or
    /// a background thread that cannot be spawned.
    pub fn with_clock(config: ExchangeConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> ExchangeResult<Self> {
        config.validate()?;

        let stats = Arc::new(PipelineStats::new());
        let sequencer = Arc::new(Sequencer::starting_after(store.max_sequence()?));
        let cache = Arc::new(QueryCache::new(config.cache.clone(), Arc::clone(&clock)));
        let hub = Arc::new(NotificationHub::new(config.hub.clone(), Arc::clone(&clock)));

        let pipeline = Arc::new(Pipeline {
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            detector: ConflictDetector::new(config.detector.clone())?,
            resolver: ConflictResolver::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                Arc::clone(&sequencer),
                config.resolver.clone(),
            ),
            hub: Arc::clone(&hub),
            cache: Arc::clone(&cache),
            stats: Arc::clone(&stats),
            deferred: Mutex::default(),
        });

        let (batch_tx, batch_rx) = bounded(config.router.pipeline_queue_capacity);
        let worker = PipelineWorker::spawn(Arc::clone(&pipeline), batch_rx)?;
        let batch = BatchAggregator::start(
            config.batch.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&stats),
            batch_tx,
        )?;
        let router = KnowledgeRouter::new(
            config.router.clone(),
            Arc::clone(&store),
            Arc::clone(&clock),
            sequencer,
            FreshnessModel::new(config.freshness.clone()),
            Arc::clone(&cache),
            batch,
        );

        let mut tasks = Vec::new();
        let sweep_hub = Arc::clone(&hub);
        tasks.push(PeriodicTask::spawn(
            "heartbeat-sweep",
            Duration::from_millis(config.hub.sweep_interval_ms),
            move || {
                sweep_hub.sweep();
            },
        )?);
        if config.cache.enabled {
            let sweep_cache = Arc::clone(&cache);
            tasks.push(PeriodicTask::spawn(
                "cache-sweep",
                Duration::from_millis(config.cache.sweep_interval_ms),
                move || {
                    let n = sweep_cache.evict_expired();
                    if n > 0 {
                        tracing::trace!(evicted = n, "expired cache entries removed");
                    }
                },
            )?);
        }

        tracing::info!(
            batch_size = config.batch.batch_size,
            flush_interval_ms = config.batch.flush_interval_ms,
            auto_resolve = config.resolver.auto_resolve,
            "exchange started"
        );

        Ok(Self {
            config,
            store,
            clock,
            router,
            pipeline,
            worker,
            hub,
            cache,
            stats,
            tasks,
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The clock every component reads.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The publish/query router.
    #[must_use]
    pub fn router(&self) -> &KnowledgeRouter {
        &self.router
    }

    /// The notification hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Accepts an item; see [`KnowledgeRouter::publish`].
    pub fn publish(&self, new: NewKnowledge) -> ExchangeResult<KnowledgeId> {
        self.router.publish(new)
    }

    /// Runs a query on behalf of `worker`.
    pub fn query(&self, worker: Option<&str>, filter: &QueryFilter) -> ExchangeResult<Vec<KnowledgeItem>> {
        self.router.query(worker, filter)
    }

    /// Active items at or above `min_freshness`, best first.
    pub fn fresh(
        &self,
        worker: Option<&str>,
        min_freshness: f64,
        limit: Option<usize>,
    ) -> ExchangeResult<Vec<KnowledgeItem>> {
        let filter = QueryFilter {
            min_freshness: Some(min_freshness),
            limit,
            ..QueryFilter::default()
        };
        self.router.query(worker, &filter)
    }

    /// One item, in any lifecycle state.
    pub fn get_item(&self, id: KnowledgeId) -> ExchangeResult<KnowledgeItem> {
        self.store
            .get_item(id)?
            .ok_or_else(|| StorageError::ItemNotFound(id).into())
    }

    /// One conflict record.
    pub fn conflict(&self, id: ConflictId) -> ExchangeResult<ConflictRecord> {
        self.store
            .get_conflict(id)?
            .ok_or_else(|| StorageError::ConflictNotFound(id).into())
    }

    /// Conflict records, newest first.
    pub fn conflicts(&self, status: Option<ConflictStatus>, limit: usize) -> ExchangeResult<Vec<ConflictRecord>> {
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(ValidationError::LimitOutOfRange {
                limit,
                max: MAX_QUERY_LIMIT,
            }
            .into());
        }
        Ok(self.store.list_conflicts(status, limit)?)
    }

    /// Resolves a conflict now, with its own strategy or `strategy`.
    pub fn resolve(&self, id: ConflictId, strategy: Option<ResolutionStrategy>) -> ExchangeResult<ConflictRecord> {
        Ok(self.pipeline.resolve(id, strategy)?)
    }

    /// Counters for one worker; `None` before first contact.
    pub fn worker_stats(&self, worker_id: &str) -> ExchangeResult<Option<WorkerKnowledgeState>> {
        Ok(self.store.get_worker_state(worker_id)?)
    }

    /// Records that `worker_id` handled `n` items of `knowledge_type`.
    pub fn record_received(&self, worker_id: &str, knowledge_type: KnowledgeType, n: u64) -> ExchangeResult<()> {
        let delta = WorkerDelta::at(self.clock.now()).received(knowledge_type, n);
        self.store
            .apply(Transaction::new().touch_worker(worker_id, delta))?;
        Ok(())
    }

    /// Opens a notification connection for a worker.
    pub fn connect(&self, worker_id: &str, connection_id: &str) -> Result<Subscription, DeliveryError> {
        self.hub.connect(worker_id, connection_id)
    }

    /// Builds a receive loop for `worker_id`.
    ///
    /// # Errors
    /// `MissingHandlers` if `registry` does not cover every accepted type.
    pub fn receiver(&self, worker_id: &str, registry: HandlerRegistry) -> ExchangeResult<KnowledgeReceiver> {
        registry.ensure_complete(&self.config.router.accepted_types)?;
        Ok(KnowledgeReceiver::new(
            worker_id,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            registry,
        ))
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> PipelineSnapshot {
        self.stats.snapshot()
    }

    /// Combined health snapshot.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport {
            accepting: !self.closed.load(Ordering::Acquire),
            pending_items: self.router.batch().pending_len(),
            deferred_conflicts: self.pipeline.deferred_len(),
            pipeline: self.stats.snapshot(),
            hub: self.hub.stats(),
            cache: self.cache.stats(),
        }
    }

    /// Flushes every buffered item and waits until the pipeline has handled it.
    pub fn flush(&self) -> ExchangeResult<()> {
        self.router.batch().flush_all();
        if self.worker.barrier(FLUSH_WAIT) {
            Ok(())
        } else {
            Err(ExchangeError::internal("pipeline did not drain in time"))
        }
    }

    /// Final flush, then stops every background thread. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("exchange shutting down");
        self.router.batch().shutdown();
        self.worker.stop();
        for task in &self.tasks {
            task.stop();
        }
        self.hub.close();
        tracing::info!(stats = ?self.stats.snapshot(), "exchange stopped");
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.shutdown();
    }
}
