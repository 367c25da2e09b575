//! Receive side: typed dispatch of published knowledge to domain handlers.
//!
//! A worker registers one [`KnowledgeHandler`] per knowledge type, checks the
//! registry at startup, and runs a [`KnowledgeReceiver`] over its hub
//! subscription. Each `knowledge_published` event is turned back into items
//! (active ones only) and handed to the handler for its type.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, ValidationError};
use crate::hub::{Connector, EventType, NotificationEvent, ReconnectingSubscriber, Subscription};
use crate::knowledge::{KnowledgeItem, KnowledgeType};
use crate::storage::{Store, Transaction};
use crate::time::Clock;
use crate::worker_state::WorkerDelta;

/// Error returned by a domain handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A domain handler for one knowledge type.
pub trait KnowledgeHandler: Send + Sync {
    /// Consumes one item.
    fn handle(&self, item: &KnowledgeItem) -> Result<(), HandlerError>;
}

impl<F> KnowledgeHandler for F
where
    F: Fn(&KnowledgeItem) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, item: &KnowledgeItem) -> Result<(), HandlerError> {
        self(item)
    }
}

/// Explicit type-to-handler map.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<KnowledgeType, Arc<dyn KnowledgeHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the handler for `knowledge_type`.
    #[must_use]
    pub fn register(mut self, knowledge_type: KnowledgeType, handler: impl KnowledgeHandler + 'static) -> Self {
        self.handlers.insert(knowledge_type, Arc::new(handler));
        self
    }

    /// Registers a closure as the handler for `knowledge_type`.
    #[must_use]
    pub fn register_fn<F>(self, knowledge_type: KnowledgeType, handler: F) -> Self
    where
        F: Fn(&KnowledgeItem) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(knowledge_type, handler)
    }

    /// Registers a shared handler.
    #[must_use]
    pub fn register_shared(mut self, knowledge_type: KnowledgeType, handler: Arc<dyn KnowledgeHandler>) -> Self {
        self.handlers.insert(knowledge_type, handler);
        self
    }

    /// The handler for a type.
    #[must_use]
    pub fn get(&self, knowledge_type: KnowledgeType) -> Option<&Arc<dyn KnowledgeHandler>> {
        self.handlers.get(&knowledge_type)
    }

    /// Types with a handler.
    pub fn types(&self) -> impl Iterator<Item = KnowledgeType> + '_ {
        self.handlers.keys().copied()
    }

    /// Fails listing every type in `required` that has no handler.
    pub fn ensure_complete(&self, required: &[KnowledgeType]) -> Result<(), ValidationError> {
        let mut missing: Vec<KnowledgeType> = required
            .iter()
            .copied()
            .filter(|t| !self.handlers.contains_key(t))
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingHandlers { missing })
        }
    }
}

/// Anything that yields hub events for one worker.
pub trait EventSource {
    /// Waits up to `timeout`; `Ok(None)` when nothing arrived.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<NotificationEvent>, DeliveryError>;
}

impl EventSource for Subscription {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<NotificationEvent>, DeliveryError> {
        self.recv_timeout(timeout)
    }
}

impl<C: Connector> EventSource for ReconnectingSubscriber<C> {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<NotificationEvent>, DeliveryError> {
        Ok(ReconnectingSubscriber::next_event(self, timeout))
    }
}

/// Receive counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStats {
    /// Items handled successfully.
    pub delivered: u64,
    /// Items whose handler returned an error.
    pub handler_failures: u64,
    /// Items skipped because they were no longer active or no longer stored.
    pub skipped: u64,
}

/// Pulls published items and dispatches them by type.
pub struct KnowledgeReceiver {
    worker_id: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    registry: HandlerRegistry,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    skipped: AtomicU64,
}

impl std::fmt::Debug for KnowledgeReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeReceiver")
            .field("worker_id", &self.worker_id)
            .field("registry", &self.registry)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl KnowledgeReceiver {
    /// Creates a receiver for `worker_id`.
    #[must_use]
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            store,
            clock,
            registry,
            delivered: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Worker identity.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Handles one event; returns how many items reached a handler successfully.
    ///
    /// Conflict events carry no items and are ignored here.
    pub fn handle_event(&self, event: &NotificationEvent) -> usize {
        if event.event_type != EventType::KnowledgePublished {
            return 0;
        }
        let Some(batch) = event.published_batch() else {
            tracing::warn!(worker_id = %self.worker_id, "malformed knowledge_published event");
            return 0;
        };
        let Some(handler) = self.registry.get(batch.knowledge_type) else {
            tracing::warn!(
                worker_id = %self.worker_id,
                knowledge_type = %batch.knowledge_type,
                "no handler registered; batch ignored"
            );
            self.skipped.fetch_add(batch.item_ids.len() as u64, Ordering::Relaxed);
            return 0;
        };

        let items = match self.store.get_items(&batch.item_ids) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "could not load published items");
                self.skipped.fetch_add(batch.item_ids.len() as u64, Ordering::Relaxed);
                return 0;
            }
        };
        let active: Vec<&KnowledgeItem> = items.iter().filter(|i| i.is_active()).collect();
        let skipped = batch.item_ids.len() - active.len();
        if skipped > 0 {
            self.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
        }

        let mut handled = 0usize;
        for item in active {
            match handler.handle(item) {
                Ok(()) => handled += 1,
                Err(e) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        worker_id = %self.worker_id,
                        item_id = %item.id,
                        knowledge_type = %item.knowledge_type,
                        error = %e,
                        "knowledge handler failed"
                    );
                }
            }
        }

        if handled > 0 {
            self.delivered.fetch_add(handled as u64, Ordering::Relaxed);
            let delta = WorkerDelta::at(self.clock.now()).received(batch.knowledge_type, handled as u64);
            if let Err(e) = self
                .store
                .apply(Transaction::new().touch_worker(self.worker_id.clone(), delta))
            {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "could not record receipt");
            }
        }
        handled
    }

    /// Handles whatever arrives within `timeout`, returning after the first event.
    pub fn poll<S: EventSource>(&self, source: &mut S, timeout: Duration) -> Result<usize, DeliveryError> {
        Ok(source
            .next_event(timeout)?
            .map_or(0, |event| self.handle_event(&event)))
    }

    /// Runs until `stop` is set or the source closes; returns items handled.
    pub fn run<S: EventSource>(&self, source: &mut S, stop: &AtomicBool, poll_every: Duration) -> usize {
        let mut total = 0;
        while !stop.load(Ordering::Acquire) {
            match self.poll(source, poll_every) {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::info!(worker_id = %self.worker_id, error = %e, "event source closed");
                    break;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use crate::hub::{HubConfig, NotificationHub, PublishedBatch};
    use crate::knowledge::NewKnowledge;
    use crate::storage::InMemoryStore;
    use crate::time::ManualClock;

    fn stored(store: &InMemoryStore, t: KnowledgeType, text: &str, seq: u64) -> KnowledgeItem {
        let item = KnowledgeItem::from_new(NewKnowledge::new("w1", t, json!(text)), Utc::now(), seq);
        store.apply(Transaction::new().insert_item(item.clone())).unwrap();
        item
    }

    fn published(items: &[&KnowledgeItem]) -> NotificationEvent {
        NotificationEvent::knowledge_published(
            &PublishedBatch {
                producer_id: "w1".to_string(),
                knowledge_type: items[0].knowledge_type,
                item_ids: items.iter().map(|i| i.id).collect(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn ensure_complete_lists_missing_types() {
        let registry = HandlerRegistry::new().register_fn(KnowledgeType::RiskPattern, |_| Ok(()));
        registry.ensure_complete(&[KnowledgeType::RiskPattern]).unwrap();

        let err = registry
            .ensure_complete(&[KnowledgeType::FailureAnalysis, KnowledgeType::RiskPattern, KnowledgeType::CodePattern])
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingHandlers {
                missing: vec![KnowledgeType::CodePattern, KnowledgeType::FailureAnalysis],
            }
        );
    }

    #[test]
    fn dispatches_by_type_and_records_receipt() {
        let store = Arc::new(InMemoryStore::new());
        let a = stored(&store, KnowledgeType::RiskPattern, "a", 1);
        let b = stored(&store, KnowledgeType::RiskPattern, "b", 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = HandlerRegistry::new().register_fn(KnowledgeType::RiskPattern, move |item| {
            sink.lock().unwrap().push(item.id);
            Ok(())
        });
        let receiver = KnowledgeReceiver::new("w2", store.clone(), Arc::new(ManualClock::starting_now()), registry);

        assert_eq!(receiver.handle_event(&published(&[&a, &b])), 2);
        assert_eq!(*seen.lock().unwrap(), vec![a.id, b.id]);
        let state = store.get_worker_state("w2").unwrap().unwrap();
        assert_eq!(state.received, 2);
        assert!(state.last_seen_at.contains_key(&KnowledgeType::RiskPattern));
    }

    #[test]
    fn inactive_items_are_skipped_and_failures_counted() {
        let store = Arc::new(InMemoryStore::new());
        let a = stored(&store, KnowledgeType::RiskPattern, "a", 1);
        let mut b = stored(&store, KnowledgeType::RiskPattern, "b", 2);
        b.mark_deprecated("superseded");
        store.apply(Transaction::new().update_item(b.clone())).unwrap();

        let registry = HandlerRegistry::new()
            .register_fn(KnowledgeType::RiskPattern, |_| Err("boom".into()));
        let receiver = KnowledgeReceiver::new("w2", store.clone(), Arc::new(ManualClock::starting_now()), registry);

        assert_eq!(receiver.handle_event(&published(&[&a, &b])), 0);
        assert_eq!(
            receiver.stats(),
            ReceiverStats {
                delivered: 0,
                handler_failures: 1,
                skipped: 1,
            }
        );
        assert!(store.get_worker_state("w2").unwrap().is_none());
    }

    #[test]
    fn poll_reads_from_a_subscription() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let hub = Arc::new(NotificationHub::new(HubConfig::default(), clock.clone()));
        let a = stored(&store, KnowledgeType::CodePattern, "a", 1);

        let registry = HandlerRegistry::new().register_fn(KnowledgeType::CodePattern, |_| Ok(()));
        let receiver = KnowledgeReceiver::new("w2", store.clone(), clock, registry);

        let mut sub = hub.connect("w2", "c1").unwrap();
        hub.send_to("w2", published(&[&a]));
        assert_eq!(receiver.poll(&mut sub, Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(receiver.poll(&mut sub, Duration::from_millis(5)).unwrap(), 0);
    }
}
