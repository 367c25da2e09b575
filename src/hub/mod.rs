//! Notification hub.
//!
//! The hub keeps a registry of worker connections and pushes
//! `knowledge_published`, `conflict_detected` and `conflict_resolved` events to
//! them. Workers that are offline get their events queued, bounded and
//! oldest-dropped, and delivered in order on their next connect.

mod backoff;
mod client;
mod connection;
mod events;
mod registry;

pub use backoff::Backoff;
pub use client::{Connector, ReconnectingSubscriber};
pub use connection::Subscription;
pub use events::{ClientMessage, EventType, NotificationEvent, PublishedBatch};
pub use registry::{HubConfig, HubStats, NotificationHub};
