//! The receiving end of a hub connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::DeliveryError;

use super::events::NotificationEvent;
use super::registry::NotificationHub;

/// One live connection of a worker.
///
/// Dropping the subscription disconnects it; events it had not yet received go
/// back to the worker's offline queue.
#[derive(Debug)]
pub struct Subscription {
    hub: Arc<NotificationHub>,
    worker_id: String,
    connection_id: String,
    token: u64,
    rx: Receiver<NotificationEvent>,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(
        hub: Arc<NotificationHub>,
        worker_id: String,
        connection_id: String,
        token: u64,
        rx: Receiver<NotificationEvent>,
    ) -> Self {
        Self {
            hub,
            worker_id,
            connection_id,
            token,
            rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Worker this connection belongs to.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Connection identity within the worker.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn closed_err(&self) -> DeliveryError {
        DeliveryError::ConnectionClosed {
            connection_id: self.connection_id.clone(),
        }
    }

    /// Blocks for the next event.
    pub fn recv(&self) -> Result<NotificationEvent, DeliveryError> {
        self.rx.recv().map_err(|_| self.closed_err())
    }

    /// Waits up to `timeout`; `Ok(None)` when nothing arrived.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<NotificationEvent>, DeliveryError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_err()),
        }
    }

    /// Returns a buffered event without blocking.
    pub fn try_recv(&self) -> Result<Option<NotificationEvent>, DeliveryError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed_err()),
        }
    }

    /// Tells the hub this connection is alive.
    pub fn heartbeat(&self) -> Result<(), DeliveryError> {
        self.hub.heartbeat(&self.worker_id, &self.connection_id)
    }

    /// Returns true while the hub still routes events to this connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.hub.is_connected(&self.worker_id, self.token)
    }

    /// Disconnects. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.hub.disconnect(&self.worker_id, &self.connection_id, self.token);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
