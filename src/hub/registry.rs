//! Connection registry and fan-out.
//!
//! Every worker the hub has seen owns a bucket holding its live connections and
//! an offline queue. Buckets are locked individually; the outer map is only
//! write-locked to add a new worker.
//!
//! A worker with no connections and nothing queued is forgotten by the sweep
//! once it has been idle for `idle_worker_ttl_ms`.
//!
//! Each connection is a bounded crossbeam channel. The hub keeps a clone of the
//! receiving end so that events still buffered when a connection dies can be
//! moved back to the offline queue and delivered on the next connect.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::DeliveryError;
use crate::time::{elapsed_ms, Clock};

use super::connection::Subscription;
use super::events::NotificationEvent;

/// Hub settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Events kept per offline worker; the oldest are dropped beyond this.
    pub offline_queue_cap: usize,
    /// Events buffered per live connection.
    pub connection_buffer: usize,
    /// Expected client heartbeat period.
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats before a connection is reaped.
    pub max_missed_heartbeats: u32,
    /// Period of the reaping sweep.
    pub sweep_interval_ms: u64,
    /// First reconnect delay for clients.
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap for clients.
    pub reconnect_max_ms: u64,
    /// Idle time after which a worker without connections or queued events is
    /// dropped from the registry.
    pub idle_worker_ttl_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            offline_queue_cap: 1000,
            connection_buffer: 256,
            heartbeat_interval_ms: 10_000,
            max_missed_heartbeats: 3,
            sweep_interval_ms: 1000,
            reconnect_base_ms: 100,
            reconnect_max_ms: 30_000,
            idle_worker_ttl_ms: 3_600_000,
        }
    }
}

impl HubConfig {
    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offline_queue_cap == 0 {
            return Err(ConfigError::invalid("hub.offline_queue_cap", "must be > 0"));
        }
        if self.connection_buffer == 0 {
            return Err(ConfigError::invalid("hub.connection_buffer", "must be > 0"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("hub.heartbeat_interval_ms", "must be > 0"));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::invalid("hub.max_missed_heartbeats", "must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("hub.sweep_interval_ms", "must be > 0"));
        }
        if self.idle_worker_ttl_ms == 0 {
            return Err(ConfigError::invalid("hub.idle_worker_ttl_ms", "must be > 0"));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::invalid(
                "hub.reconnect_max_ms",
                "reconnect delays must satisfy 0 < base <= max",
            ));
        }
        Ok(())
    }

    /// Silence after which a connection is reaped.
    #[must_use]
    pub fn liveness_window_ms(&self) -> u64 {
        self.heartbeat_interval_ms
            .saturating_mul(u64::from(self.max_missed_heartbeats))
    }
}

#[derive(Debug)]
struct Connection {
    id: String,
    token: u64,
    tx: Sender<NotificationEvent>,
    backlog: Receiver<NotificationEvent>,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Debug)]
struct WorkerBucket {
    connections: Vec<Connection>,
    offline: VecDeque<NotificationEvent>,
    last_active: DateTime<Utc>,
    // Set once the bucket is unlinked from the registry.
    evicted: bool,
}

impl WorkerBucket {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            connections: Vec::new(),
            offline: VecDeque::new(),
            last_active: now,
            evicted: false,
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, ttl_ms: u64) -> bool {
        self.connections.is_empty() && self.offline.is_empty() && elapsed_ms(self.last_active, now) > ttl_ms
    }
}

/// Registry of worker connections.
#[derive(Debug)]
pub struct NotificationHub {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerBucket>>>>,
    next_token: AtomicU64,
    dropped: AtomicU64,
    reaped: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicBool,
}

/// Hub counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Workers known to the hub.
    pub workers: usize,
    /// Live connections.
    pub connections: usize,
    /// Events waiting in offline queues.
    pub queued: usize,
    /// Events dropped because an offline queue was full.
    pub dropped: u64,
    /// Connections removed for missing heartbeats.
    pub reaped: u64,
    /// Idle workers dropped from the registry.
    pub evicted: u64,
}

impl NotificationHub {
    /// Creates a hub.
    #[must_use]
    pub fn new(config: HubConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            workers: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn bucket(&self, worker_id: &str) -> Arc<Mutex<WorkerBucket>> {
        if let Some(b) = self
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
        {
            return Arc::clone(b);
        }
        let now = self.clock.now();
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            workers
                .entry(worker_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(WorkerBucket::new(now)))),
        )
    }

    /// Runs `f` on the live bucket of `worker_id`, creating it if needed.
    fn with_bucket<R>(&self, worker_id: &str, f: impl FnOnce(&mut WorkerBucket) -> R) -> R {
        loop {
            let bucket = self.bucket(worker_id);
            let mut guard = Self::lock(&bucket);
            // Lost a race with eviction; the next lookup creates a fresh bucket.
            if guard.evicted {
                continue;
            }
            guard.last_active = self.clock.now();
            return f(&mut guard);
        }
    }

    fn existing_bucket(&self, worker_id: &str) -> Option<Arc<Mutex<WorkerBucket>>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
    }

    fn all_buckets(&self) -> Vec<(String, Arc<Mutex<WorkerBucket>>)> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    fn lock(bucket: &Mutex<WorkerBucket>) -> MutexGuard<'_, WorkerBucket> {
        bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_offline(&self, worker_id: &str, bucket: &mut WorkerBucket, event: NotificationEvent) {
        bucket.offline.push_back(event);
        while bucket.offline.len() > self.config.offline_queue_cap {
            bucket.offline.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(worker_id = %worker_id, "offline queue full; dropped oldest event");
        }
    }

    /// Moves whatever the connection still buffers back to the offline queue.
    fn retire(&self, worker_id: &str, bucket: &mut WorkerBucket, conn: Connection) {
        bucket.last_active = self.clock.now();
        drop(conn.tx);
        for event in conn.backlog.try_iter() {
            self.push_offline(worker_id, bucket, event);
        }
    }

    /// Registers a connection and delivers the worker's offline queue to it.
    ///
    /// Reusing a live `connection_id` replaces the old connection; events it had
    /// not delivered are handed to the new one first.
    pub fn connect(
        self: &Arc<Self>,
        worker_id: &str,
        connection_id: &str,
    ) -> Result<Subscription, DeliveryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeliveryError::HubClosed);
        }
        if worker_id.trim().is_empty() || connection_id.trim().is_empty() {
            return Err(DeliveryError::ConnectionClosed {
                connection_id: connection_id.to_string(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let rx = self.with_bucket(worker_id, |bucket| {
            if let Some(pos) = bucket.connections.iter().position(|c| c.id == connection_id) {
                let old = bucket.connections.remove(pos);
                self.retire(worker_id, bucket, old);
            }

            let capacity = self.config.connection_buffer + self.config.offline_queue_cap;
            let (tx, rx) = bounded(capacity);
            for event in bucket.offline.drain(..) {
                // Capacity covers a full offline queue.
                let _ = tx.try_send(event);
            }

            bucket.connections.push(Connection {
                id: connection_id.to_string(),
                token,
                tx,
                backlog: rx.clone(),
                last_heartbeat: self.clock.now(),
            });
            rx
        });

        tracing::info!(worker_id = %worker_id, connection_id = %connection_id, "worker connected");
        Ok(Subscription::new(
            Arc::clone(self),
            worker_id.to_string(),
            connection_id.to_string(),
            token,
            rx,
        ))
    }

    /// Delivers to every connection of `worker_id`, or queues the event offline.
    pub fn send_to(&self, worker_id: &str, event: NotificationEvent) {
        self.with_bucket(worker_id, |bucket| self.deliver(worker_id, bucket, event));
    }

    /// Takes back events a consumer pulled from a connection but could not
    /// hand on, oldest first.
    ///
    /// With no live connection they go to the front of the offline queue and
    /// reach the next connect ahead of anything queued later. Otherwise they
    /// are delivered to the live connections.
    pub fn requeue(&self, worker_id: &str, events: Vec<NotificationEvent>) {
        if events.is_empty() {
            return;
        }
        let n = events.len();
        self.with_bucket(worker_id, |bucket| {
            if !bucket.connections.is_empty() {
                for event in events {
                    self.deliver(worker_id, bucket, event);
                }
                return;
            }
            for event in events.into_iter().rev() {
                bucket.offline.push_front(event);
            }
            while bucket.offline.len() > self.config.offline_queue_cap {
                bucket.offline.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        });
        tracing::debug!(worker_id = %worker_id, events = n, "undelivered events requeued");
    }

    fn deliver(&self, worker_id: &str, bucket: &mut WorkerBucket, event: NotificationEvent) {
        let mut delivered = false;
        let mut failed = Vec::new();
        for (idx, conn) in bucket.connections.iter().enumerate() {
            match conn.tx.try_send(event.clone()) {
                Ok(()) => delivered = true,
                Err(TrySendError::Full(_)) => {
                    let err = DeliveryError::ConnectionFull {
                        connection_id: conn.id.clone(),
                    };
                    tracing::warn!(worker_id = %worker_id, error = %err, "dropping connection");
                    failed.push(idx);
                }
                Err(TrySendError::Disconnected(_)) => {
                    let err = DeliveryError::ConnectionClosed {
                        connection_id: conn.id.clone(),
                    };
                    tracing::debug!(worker_id = %worker_id, error = %err, "dropping connection");
                    failed.push(idx);
                }
            }
        }
        for idx in failed.into_iter().rev() {
            let conn = bucket.connections.remove(idx);
            self.retire(worker_id, bucket, conn);
        }
        if !delivered {
            self.push_offline(worker_id, bucket, event);
        }
    }

    /// Delivers to every known worker except `exclude`.
    pub fn broadcast(&self, event: &NotificationEvent, exclude: Option<&str>) {
        for (worker_id, bucket) in self.all_buckets() {
            if exclude == Some(worker_id.as_str()) {
                continue;
            }
            let mut guard = Self::lock(&bucket);
            if !guard.evicted {
                self.deliver(&worker_id, &mut guard, event.clone());
            }
        }
    }

    /// Records a heartbeat.
    pub fn heartbeat(&self, worker_id: &str, connection_id: &str) -> Result<(), DeliveryError> {
        let closed = || DeliveryError::ConnectionClosed {
            connection_id: connection_id.to_string(),
        };
        let bucket = self.existing_bucket(worker_id).ok_or_else(closed)?;
        let mut guard = Self::lock(&bucket);
        let conn = guard
            .connections
            .iter_mut()
            .find(|c| c.id == connection_id)
            .ok_or_else(closed)?;
        let now = self.clock.now();
        conn.last_heartbeat = now;
        guard.last_active = now;
        Ok(())
    }

    /// Reaps connections silent for longer than the liveness window, then
    /// forgets idle workers. Returns how many connections were reaped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.liveness_window_ms();
        let mut reaped = 0;
        let mut idle = Vec::new();
        for (worker_id, bucket) in self.all_buckets() {
            let mut guard = Self::lock(&bucket);
            let mut i = 0;
            while i < guard.connections.len() {
                if elapsed_ms(guard.connections[i].last_heartbeat, now) > window {
                    let conn = guard.connections.remove(i);
                    tracing::info!(
                        worker_id = %worker_id,
                        connection_id = %conn.id,
                        "connection missed heartbeats; reaped"
                    );
                    self.retire(&worker_id, &mut guard, conn);
                    reaped += 1;
                } else {
                    i += 1;
                }
            }
            if guard.is_idle(now, self.config.idle_worker_ttl_ms) {
                idle.push(worker_id);
            }
        }
        self.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
        if !idle.is_empty() {
            self.evict_idle(&idle, now);
        }
        reaped
    }

    fn evict_idle(&self, candidates: &[String], now: DateTime<Utc>) {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        for worker_id in candidates {
            let Some(bucket) = workers.get(worker_id).cloned() else {
                continue;
            };
            let mut guard = Self::lock(&bucket);
            if !guard.is_idle(now, self.config.idle_worker_ttl_ms) {
                continue;
            }
            guard.evicted = true;
            drop(guard);
            workers.remove(worker_id);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(worker_id = %worker_id, "idle worker forgotten");
        }
    }

    /// Removes one connection if `token` still identifies it.
    pub(crate) fn disconnect(&self, worker_id: &str, connection_id: &str, token: u64) {
        let Some(bucket) = self.existing_bucket(worker_id) else {
            return;
        };
        let mut guard = Self::lock(&bucket);
        if let Some(pos) = guard
            .connections
            .iter()
            .position(|c| c.id == connection_id && c.token == token)
        {
            let conn = guard.connections.remove(pos);
            self.retire(worker_id, &mut guard, conn);
            tracing::info!(worker_id = %worker_id, connection_id = %connection_id, "worker disconnected");
        }
    }

    fn inspect<R>(&self, worker_id: &str, f: impl FnOnce(&WorkerBucket) -> R) -> Option<R> {
        let bucket = self.existing_bucket(worker_id)?;
        let guard = Self::lock(&bucket);
        Some(f(&guard))
    }

    pub(crate) fn is_connected(&self, worker_id: &str, token: u64) -> bool {
        self.inspect(worker_id, |b| b.connections.iter().any(|c| c.token == token))
            .unwrap_or(false)
    }

    /// Drops every connection and refuses new ones. Offline queues are kept.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (worker_id, bucket) in self.all_buckets() {
            let mut guard = Self::lock(&bucket);
            let conns: Vec<Connection> = guard.connections.drain(..).collect();
            for conn in conns {
                self.retire(&worker_id, &mut guard, conn);
            }
        }
    }

    /// Returns true once `close` ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events waiting for `worker_id`'s next connect.
    #[must_use]
    pub fn offline_len(&self, worker_id: &str) -> usize {
        self.inspect(worker_id, |b| b.offline.len()).unwrap_or(0)
    }

    /// Live connections of `worker_id`.
    #[must_use]
    pub fn connection_count(&self, worker_id: &str) -> usize {
        self.inspect(worker_id, |b| b.connections.len()).unwrap_or(0)
    }

    /// Snapshot of hub counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let buckets = self.all_buckets();
        let mut stats = HubStats {
            workers: buckets.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..HubStats::default()
        };
        for (_, bucket) in buckets {
            let guard = Self::lock(&bucket);
            stats.connections += guard.connections.len();
            stats.queued += guard.offline.len();
        }
        stats
    }
}
