//! Client side of the hub: a subscription that survives reaping.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DeliveryError;

use super::backoff::Backoff;
use super::connection::Subscription;
use super::events::NotificationEvent;
use super::registry::NotificationHub;

/// Opens connections for a worker.
pub trait Connector: Send + Sync {
    /// Opens a new connection.
    fn connect(&self, worker_id: &str, connection_id: &str) -> Result<Subscription, DeliveryError>;
}

impl Connector for Arc<NotificationHub> {
    fn connect(&self, worker_id: &str, connection_id: &str) -> Result<Subscription, DeliveryError> {
        NotificationHub::connect(self, worker_id, connection_id)
    }
}

/// Keeps one connection open, reconnecting with exponential backoff.
///
/// The delay doubles from the base after each failed attempt, is capped, and
/// resets after a successful connect. Heartbeats are sent automatically while
/// waiting for events.
pub struct ReconnectingSubscriber<C: Connector> {
    connector: C,
    worker_id: String,
    connection_id: String,
    backoff: Backoff,
    heartbeat_every: Duration,
    last_heartbeat: Instant,
    current: Option<Subscription>,
    connects: u64,
}

impl<C: Connector> std::fmt::Debug for ReconnectingSubscriber<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSubscriber")
            .field("worker_id", &self.worker_id)
            .field("connection_id", &self.connection_id)
            .field("connected", &self.current.is_some())
            .field("connects", &self.connects)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ReconnectingSubscriber<C> {
    /// Creates a subscriber; the first connection is opened lazily.
    pub fn new(
        connector: C,
        worker_id: impl Into<String>,
        connection_id: impl Into<String>,
        backoff: Backoff,
        heartbeat_every: Duration,
    ) -> Self {
        Self {
            connector,
            worker_id: worker_id.into(),
            connection_id: connection_id.into(),
            backoff,
            heartbeat_every,
            last_heartbeat: Instant::now(),
            current: None,
            connects: 0,
        }
    }

    /// Worker identity.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Successful connects so far (1 means never reconnected).
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects
    }

    /// Current backoff state.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Connects if needed; gives up at `deadline`.
    fn ensure_connected(&mut self, deadline: Instant) -> bool {
        while self.current.is_none() {
            match self.connector.connect(&self.worker_id, &self.connection_id) {
                Ok(sub) => {
                    self.backoff.reset();
                    self.connects += 1;
                    self.last_heartbeat = Instant::now();
                    if self.connects > 1 {
                        tracing::info!(worker_id = %self.worker_id, connects = self.connects, "reconnected");
                    }
                    self.current = Some(sub);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    if Instant::now() + delay > deadline {
                        tracing::debug!(worker_id = %self.worker_id, error = %e, "connect failed; deadline reached");
                        return false;
                    }
                    tracing::debug!(worker_id = %self.worker_id, error = %e, ?delay, "connect failed; backing off");
                    thread::sleep(delay);
                }
            }
        }
        true
    }

    /// Waits up to `timeout` for the next event, reconnecting as needed.
    pub fn next_event(&mut self, timeout: Duration) -> Option<NotificationEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.ensure_connected(deadline) {
                return None;
            }
            let sub = self.current.as_ref()?;
            if self.last_heartbeat.elapsed() >= self.heartbeat_every && sub.heartbeat().is_ok() {
                self.last_heartbeat = Instant::now();
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.heartbeat_every.max(Duration::from_millis(1)));
            match sub.recv_timeout(wait) {
                Ok(Some(event)) => return Some(event),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                Err(e) => {
                    tracing::debug!(worker_id = %self.worker_id, error = %e, "connection lost");
                    self.current = None;
                }
            }
        }
    }

    /// Drops the current connection.
    pub fn disconnect(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use crate::hub::{EventType, HubConfig};
    use crate::time::ManualClock;

    struct FlakyConnector {
        hub: Arc<NotificationHub>,
        failures_left: AtomicU32,
    }

    impl Connector for FlakyConnector {
        fn connect(&self, worker_id: &str, connection_id: &str) -> Result<Subscription, DeliveryError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DeliveryError::ConnectionClosed {
                    connection_id: connection_id.to_string(),
                });
            }
            self.hub.connect(worker_id, connection_id)
        }
    }

    fn event(n: u64) -> NotificationEvent {
        NotificationEvent {
            event_type: EventType::ConflictDetected,
            data: json!({ "n": n }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn retries_with_backoff_then_resets() {
        let clock = Arc::new(ManualClock::starting_now());
        let hub = Arc::new(NotificationHub::new(HubConfig::default(), clock));
        hub.send_to("w1", event(1));

        let connector = FlakyConnector {
            hub: Arc::clone(&hub),
            failures_left: AtomicU32::new(2),
        };
        let mut sub = ReconnectingSubscriber::new(
            connector,
            "w1",
            "c1",
            Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            Duration::from_secs(1),
        );

        let got = sub.next_event(Duration::from_secs(5)).unwrap();
        assert_eq!(got.data["n"], 1);
        assert_eq!(sub.connects(), 1);
        assert_eq!(sub.backoff().attempts(), 0);
    }

    #[test]
    fn reconnects_after_reap_and_receives_requeued_events() {
        let clock = Arc::new(ManualClock::starting_now());
        let hub = Arc::new(NotificationHub::new(
            HubConfig {
                heartbeat_interval_ms: 100,
                max_missed_heartbeats: 1,
                ..HubConfig::default()
            },
            clock.clone(),
        ));
        let mut sub = ReconnectingSubscriber::new(
            Arc::clone(&hub),
            "w1",
            "c1",
            Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            Duration::from_secs(60),
        );
        assert!(sub.next_event(Duration::from_millis(10)).is_none());
        assert_eq!(hub.connection_count("w1"), 1);

        hub.send_to("w1", event(2));
        clock.advance(Duration::from_millis(500));
        assert_eq!(hub.sweep(), 1);

        let got = sub.next_event(Duration::from_secs(5)).unwrap();
        assert_eq!(got.data["n"], 2);
        assert_eq!(sub.connects(), 2);
    }
}
