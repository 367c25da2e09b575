use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kyroql_exchange::batch::BatchConfig;
use kyroql_exchange::hub::{EventType, HubConfig, PublishedBatch, ReconnectingSubscriber};
use kyroql_exchange::{
    Backoff, Exchange, ExchangeConfig, InMemoryStore, KnowledgeId, KnowledgeType, ManualClock, NewKnowledge,
    NotificationEvent, NotificationHub,
};
use serde_json::json;

fn exchange() -> Exchange {
    let config = ExchangeConfig {
        batch: BatchConfig {
            batch_size: 100,
            flush_interval_ms: 3_600_000,
            ..BatchConfig::default()
        },
        ..ExchangeConfig::default()
    };
    Exchange::with_clock(config, Arc::new(InMemoryStore::new()), Arc::new(ManualClock::starting_now())).unwrap()
}

fn published(n: usize) -> NotificationEvent {
    let batch = PublishedBatch {
        producer_id: "w1".to_string(),
        knowledge_type: KnowledgeType::RiskPattern,
        item_ids: (0..n).map(|_| KnowledgeId::new()).collect(),
    };
    NotificationEvent::knowledge_published(&batch, Utc::now())
}

#[test]
fn offline_worker_receives_backlog_on_reconnect() {
    let ex = exchange();
    drop(ex.connect("w2", "c1").unwrap());

    ex.publish(NewKnowledge::new("w1", KnowledgeType::DecisionMade, json!("pin the toolchain version")))
        .unwrap();
    ex.flush().unwrap();
    assert_eq!(ex.hub().offline_len("w2"), 1);

    let sub = ex.connect("w2", "c2").unwrap();
    let event = sub.try_recv().unwrap().unwrap();
    assert_eq!(event.event_type, EventType::KnowledgePublished);
    assert_eq!(ex.hub().offline_len("w2"), 0);
}

#[test]
fn producer_is_not_notified_of_its_own_batch() {
    let ex = exchange();
    let producer = ex.connect("w1", "c1").unwrap();
    let peer = ex.connect("w2", "c1").unwrap();

    ex.publish(NewKnowledge::new("w1", KnowledgeType::CodePattern, json!("builders over long constructors")))
        .unwrap();
    ex.flush().unwrap();

    assert!(peer.recv_timeout(Duration::from_secs(5)).unwrap().is_some());
    assert!(producer.recv_timeout(Duration::from_millis(100)).unwrap().is_none());
}

#[test]
fn every_connection_of_a_worker_gets_the_event() {
    let ex = exchange();
    let a = ex.connect("w2", "laptop").unwrap();
    let b = ex.connect("w2", "server").unwrap();
    assert_eq!(ex.hub().connection_count("w2"), 2);

    ex.publish(NewKnowledge::new("w1", KnowledgeType::RiskPattern, json!("global mutable config")))
        .unwrap();
    ex.flush().unwrap();

    assert!(a.recv_timeout(Duration::from_secs(5)).unwrap().is_some());
    assert!(b.recv_timeout(Duration::from_secs(5)).unwrap().is_some());
}

#[test]
fn full_offline_queue_drops_oldest() {
    let clock = Arc::new(ManualClock::starting_now());
    let hub = Arc::new(NotificationHub::new(
        HubConfig {
            offline_queue_cap: 2,
            ..HubConfig::default()
        },
        clock,
    ));

    let events: Vec<NotificationEvent> = (1..=3).map(published).collect();
    for event in &events {
        hub.send_to("w2", event.clone());
    }
    assert_eq!(hub.offline_len("w2"), 2);
    assert_eq!(hub.stats().dropped, 1);

    let sub = hub.connect("w2", "c1").unwrap();
    assert_eq!(sub.try_recv().unwrap(), Some(events[1].clone()));
    assert_eq!(sub.try_recv().unwrap(), Some(events[2].clone()));
    assert_eq!(sub.try_recv().unwrap(), None);
}

#[test]
fn reaped_subscriber_reconnects_and_drains_offline_queue() {
    let clock = Arc::new(ManualClock::starting_now());
    let hub = Arc::new(NotificationHub::new(HubConfig::default(), clock.clone()));
    let mut subscriber = ReconnectingSubscriber::new(
        Arc::clone(&hub),
        "w2",
        "c1",
        Backoff::new(Duration::from_millis(5), Duration::from_millis(50)),
        Duration::from_secs(3600),
    );

    assert!(subscriber.next_event(Duration::from_millis(20)).is_none());
    assert_eq!(subscriber.connects(), 1);
    assert_eq!(hub.connection_count("w2"), 1);

    clock.advance(Duration::from_millis(hub.config().liveness_window_ms() + 1));
    assert_eq!(hub.sweep(), 1);
    assert_eq!(hub.connection_count("w2"), 0);

    let event = published(1);
    hub.send_to("w2", event.clone());
    assert_eq!(hub.offline_len("w2"), 1);

    assert_eq!(subscriber.next_event(Duration::from_secs(5)), Some(event));
    assert_eq!(subscriber.connects(), 2);
    assert_eq!(hub.stats().reaped, 1);
}

#[test]
fn closed_hub_refuses_connections() {
    let ex = exchange();
    let sub = ex.connect("w2", "c1").unwrap();
    ex.shutdown();
    assert!(ex.connect("w2", "c2").is_err());
    assert!(sub.recv_timeout(Duration::from_millis(50)).is_err());
}
