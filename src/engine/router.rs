//! Publish and query entry point.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::batch::BatchAggregator;
use crate::cache::{cache_key, QueryCache};
use crate::config::ConfigError;
use crate::error::{ExchangeResult, ValidationError};
use crate::freshness::FreshnessModel;
use crate::knowledge::{KnowledgeId, KnowledgeItem, KnowledgeType, NewKnowledge, Sequencer};
use crate::query::{rank, QueryFilter};
use crate::storage::{ItemScan, Store};
use crate::time::Clock;

/// Router settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Types this exchange accepts for publish.
    pub accepted_types: Vec<KnowledgeType>,
    /// Largest serialized payload accepted.
    pub max_payload_bytes: usize,
    /// Flushed batches waiting for the pipeline worker.
    pub pipeline_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            accepted_types: KnowledgeType::ALL.to_vec(),
            max_payload_bytes: 64 * 1024,
            pipeline_queue_capacity: 4096,
        }
    }
}

impl RouterConfig {
    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accepted_types.is_empty() {
            return Err(ConfigError::invalid("router.accepted_types", "must not be empty"));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::invalid("router.max_payload_bytes", "must be > 0"));
        }
        if self.pipeline_queue_capacity == 0 {
            return Err(ConfigError::invalid("router.pipeline_queue_capacity", "must be > 0"));
        }
        Ok(())
    }

    /// Returns true if publishes of `t` are accepted.
    #[must_use]
    pub fn accepts(&self, t: KnowledgeType) -> bool {
        self.accepted_types.contains(&t)
    }
}

/// Synchronous publish/query surface.
///
/// Publish validates, stamps and enqueues; everything after that happens on
/// background threads. Queries read through the cache.
pub struct KnowledgeRouter {
    config: RouterConfig,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    sequencer: Arc<Sequencer>,
    freshness: FreshnessModel,
    cache: Arc<QueryCache>,
    batch: BatchAggregator,
    publish_lock: Mutex<()>,
}

impl std::fmt::Debug for KnowledgeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeRouter")
            .field("config", &self.config)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}

impl KnowledgeRouter {
    pub(crate) fn new(
        config: RouterConfig,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        sequencer: Arc<Sequencer>,
        freshness: FreshnessModel,
        cache: Arc<QueryCache>,
        batch: BatchAggregator,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            sequencer,
            freshness,
            cache,
            batch,
            publish_lock: Mutex::new(()),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The freshness model used for queries.
    #[must_use]
    pub fn freshness(&self) -> &FreshnessModel {
        &self.freshness
    }

    pub(crate) fn batch(&self) -> &BatchAggregator {
        &self.batch
    }

    /// Checks a publish request without accepting it.
    pub fn validate(&self, new: &NewKnowledge) -> Result<(), ValidationError> {
        if new.producer_id.trim().is_empty() {
            return Err(ValidationError::EmptyProducerId);
        }
        if !self.config.accepts(new.knowledge_type) {
            return Err(ValidationError::KnowledgeTypeNotAccepted {
                knowledge_type: new.knowledge_type,
            });
        }
        let size = new.payload_size();
        if size > self.config.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Accepts an item and returns its id.
    ///
    /// The item becomes visible to queries once its batch is flushed.
    ///
    /// # Errors
    /// Validation errors only, plus an internal error after shutdown.
    pub fn publish(&self, new: NewKnowledge) -> ExchangeResult<KnowledgeId> {
        self.validate(&new)?;

        // Sequence order and queue order must agree.
        let _guard = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let item = KnowledgeItem::from_new(new, self.clock.now(), self.sequencer.next());
        let id = item.id;
        tracing::debug!(
            item_id = %id,
            producer_id = %item.producer_id,
            knowledge_type = %item.knowledge_type,
            sequence = item.sequence,
            "knowledge accepted"
        );
        self.batch.enqueue(item)?;
        Ok(id)
    }

    /// Runs a query on behalf of `worker` (anonymous when `None`).
    pub fn query(&self, worker: Option<&str>, filter: &QueryFilter) -> ExchangeResult<Vec<KnowledgeItem>> {
        filter.validate()?;

        let key = cache_key(worker, filter);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        // An invalidation after this point keeps the result out of the cache.
        let epoch = self.cache.epoch(filter);
        let scan = ItemScan {
            producer_id: filter.source_worker.clone(),
            types: filter.types.clone(),
            created_since: None,
            include_inactive: filter.include_inactive,
        };
        let candidates = self.store.scan_items(&scan)?;
        let ranked = rank(candidates, filter, &self.freshness, self.clock.now());
        self.cache.put(key, filter, ranked.clone(), epoch);
        Ok(ranked)
    }
}
