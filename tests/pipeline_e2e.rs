use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kyroql_exchange::batch::BatchConfig;
use kyroql_exchange::hub::EventType;
use kyroql_exchange::{
    ConflictKind, ConflictStatus, Exchange, ExchangeConfig, HandlerRegistry, InMemoryStore, ItemState,
    KnowledgeType, ManualClock, NewKnowledge, QueryFilter, Urgency,
};
use serde_json::json;

fn config() -> ExchangeConfig {
    ExchangeConfig {
        batch: BatchConfig {
            batch_size: 100,
            flush_interval_ms: 3_600_000,
            ..BatchConfig::default()
        },
        ..ExchangeConfig::default()
    }
}

fn exchange() -> (Arc<ManualClock>, Exchange) {
    let clock = Arc::new(ManualClock::starting_now());
    let exchange = Exchange::with_clock(config(), Arc::new(InMemoryStore::new()), clock.clone()).unwrap();
    (clock, exchange)
}

fn registry_counting(counter: &Arc<AtomicUsize>) -> HandlerRegistry {
    KnowledgeType::ALL.iter().fold(HandlerRegistry::new(), |registry, t| {
        let counter = Arc::clone(counter);
        registry.register_fn(*t, move |_item| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

#[test]
fn published_knowledge_reaches_other_workers() {
    let (_, ex) = exchange();
    let subscription = ex.connect("w2", "c1").unwrap();

    ex.publish(NewKnowledge::new("w1", KnowledgeType::RiskPattern, json!("auth module has flaky retries")))
        .unwrap();
    ex.publish(NewKnowledge::new(
        "w1",
        KnowledgeType::RiskPattern,
        json!("payment reconciliation runs without locks"),
    ))
    .unwrap();
    ex.flush().unwrap();

    let event = subscription.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(event.event_type, EventType::KnowledgePublished);
    let batch = event.published_batch().unwrap();
    assert_eq!(batch.producer_id, "w1");
    assert_eq!(batch.item_ids.len(), 2);

    let handled = Arc::new(AtomicUsize::new(0));
    let receiver = ex.receiver("w2", registry_counting(&handled)).unwrap();
    assert_eq!(receiver.handle_event(&event), 2);
    assert_eq!(handled.load(Ordering::SeqCst), 2);

    let w2 = ex.worker_stats("w2").unwrap().unwrap();
    assert_eq!(w2.received, 2);
    let w1 = ex.worker_stats("w1").unwrap().unwrap();
    assert_eq!(w1.published, 2);
    assert_eq!(w1.conflicts_involved, 0);
}

#[test]
fn receiver_requires_a_handler_for_every_accepted_type() {
    let (_, ex) = exchange();
    let partial = HandlerRegistry::new().register_fn(KnowledgeType::RiskPattern, |_item| Ok(()));
    let err = ex.receiver("w2", partial).unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn duplicates_are_merged_into_one_active_item() {
    let (_, ex) = exchange();
    for _ in 0..3 {
        ex.publish(NewKnowledge::new(
            "w1",
            KnowledgeType::CodePattern,
            json!("prefer iterator adapters over index loops"),
        ))
        .unwrap();
    }
    ex.flush().unwrap();

    let conflicts = ex.conflicts(None, 100).unwrap();
    assert_eq!(conflicts.len(), 2);
    assert!(conflicts.iter().all(|c| c.kind == ConflictKind::Duplicate));
    assert!(conflicts.iter().all(|c| c.status == ConflictStatus::Resolved));

    let active = ex.query(None, &QueryFilter::new()).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].merged_from.len(), 3);

    // The second record folds into the item the first one created.
    let audit = ex.query(None, &QueryFilter::new().include_inactive()).unwrap();
    assert_eq!(audit.len(), 4);
    assert_eq!(audit.iter().filter(|i| i.state == ItemState::Merged).count(), 3);
    assert!(audit
        .iter()
        .filter(|i| i.state == ItemState::Merged)
        .all(|i| i.merged_into == Some(active[0].id)));

    let stats = ex.stats();
    assert_eq!(stats.conflicts_detected, 2);
    assert_eq!(stats.conflicts_resolved, 2);
}

#[test]
fn stale_knowledge_drops_below_freshness_threshold() {
    let (clock, ex) = exchange();
    ex.publish(
        NewKnowledge::new("w1", KnowledgeType::PerformanceInsight, json!("hot path allocates per request"))
            .urgency(Urgency::Critical),
    )
    .unwrap();
    ex.publish(
        NewKnowledge::new("w1", KnowledgeType::FailureAnalysis, json!("migration failed on empty tables"))
            .urgency(Urgency::Low),
    )
    .unwrap();
    ex.flush().unwrap();

    // Two critical half-lives.
    clock.advance(Duration::from_secs(30 * 60));

    let fresh = ex.fresh(Some("w3"), 0.5, None).unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].knowledge_type, KnowledgeType::FailureAnalysis);

    let everything = ex.query(Some("w4"), &QueryFilter::new()).unwrap();
    assert_eq!(everything.len(), 2);
}

#[test]
fn query_filters_by_type_and_source() {
    let (_, ex) = exchange();
    ex.publish(NewKnowledge::new("w1", KnowledgeType::RiskPattern, json!("unbounded queue in ingest")))
        .unwrap();
    ex.publish(NewKnowledge::new("w2", KnowledgeType::RiskPattern, json!("retry storm on timeouts")))
        .unwrap();
    ex.publish(NewKnowledge::new("w2", KnowledgeType::DecisionMade, json!("adopt structured logging")))
        .unwrap();
    ex.flush().unwrap();

    let risks = ex
        .query(None, &QueryFilter::new().with_type(KnowledgeType::RiskPattern))
        .unwrap();
    assert_eq!(risks.len(), 2);

    let from_w2 = ex
        .query(
            None,
            &QueryFilter::new()
                .with_type(KnowledgeType::RiskPattern)
                .source_worker("w2"),
        )
        .unwrap();
    assert_eq!(from_w2.len(), 1);
    assert_eq!(from_w2[0].producer_id, "w2");

    assert_eq!(ex.query(None, &QueryFilter::new().limit(1)).unwrap().len(), 1);
    assert!(ex.query(None, &QueryFilter::new().limit(0)).is_err());
}

#[test]
fn partial_batch_flushes_on_the_interval() {
    let config = ExchangeConfig {
        batch: BatchConfig {
            batch_size: 5,
            flush_interval_ms: 1000,
            ..BatchConfig::default()
        },
        ..ExchangeConfig::default()
    };
    let ex = Exchange::with_clock(config, Arc::new(InMemoryStore::new()), Arc::new(ManualClock::starting_now()))
        .unwrap();
    let subscription = ex.connect("w2", "c1").unwrap();

    for n in 0..4 {
        ex.publish(NewKnowledge::new(
            "w1",
            KnowledgeType::FailureAnalysis,
            json!(format!("job {n} timed out waiting on the scheduler lock")),
        ))
        .unwrap();
    }
    assert_eq!(ex.health().pending_items, 4);
    assert!(ex.query(None, &QueryFilter::new()).unwrap().is_empty());

    // No explicit flush: the flusher picks the group up once it is due.
    let event = subscription.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(event.event_type, EventType::KnowledgePublished);
    assert_eq!(event.published_batch().unwrap().item_ids.len(), 4);
    assert_eq!(ex.health().pending_items, 0);
    assert_eq!(ex.query(Some("w2"), &QueryFilter::new()).unwrap().len(), 4);
}

#[test]
fn critical_knowledge_leaves_fresh_results_after_two_half_lives() {
    let (clock, ex) = exchange();
    let id = ex
        .publish(
            NewKnowledge::new("w1", KnowledgeType::RiskPattern, json!("leader election flaps under packet loss"))
                .urgency(Urgency::Critical)
                .priority(5),
        )
        .unwrap();
    ex.flush().unwrap();

    let fresh = ex.query(None, &QueryFilter::new().min_freshness(0.9)).unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].id, id);
    assert_eq!(fresh[0].priority, 5);

    // Critical half-life is 15 minutes.
    clock.advance(Duration::from_secs(2 * 15 * 60));
    assert!(ex.query(None, &QueryFilter::new().min_freshness(0.9)).unwrap().is_empty());
    assert_eq!(ex.query(None, &QueryFilter::new()).unwrap().len(), 1);
}
