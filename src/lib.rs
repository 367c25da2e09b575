//! # KyroQL Exchange - knowledge distribution for worker fleets
//!
//! A fleet of autonomous workers discovers, proposes and evaluates changes to a
//! codebase. Each worker learns things ("this module is risky", "this refactor
//! pattern failed") that the others should not have to rediscover. This crate is
//! the substrate that moves that knowledge between them.
//!
//! ## Core Concepts
//!
//! - **KnowledgeItem**: an immutable unit of knowledge with a lifecycle flag
//! - **Freshness**: relevance decayed by urgency class and age
//! - **ConflictRecord**: an explicit duplicate/contradiction/overlap between items
//! - **NotificationHub**: per-worker fan-out with offline queues and heartbeats
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyroql_exchange::{Exchange, ExchangeConfig, InMemoryStore, KnowledgeType, NewKnowledge, QueryFilter};
//!
//! let exchange = Exchange::start(ExchangeConfig::default(), Arc::new(InMemoryStore::new()))?;
//! let id = exchange.publish(
//!     NewKnowledge::new("worker-1", KnowledgeType::RiskPattern, serde_json::json!("auth module is brittle")),
//! )?;
//! let fresh = exchange.query(Some("worker-2"), &QueryFilter::new().min_freshness(0.5))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod freshness;
pub mod knowledge;
pub mod query;
pub mod time;
pub mod worker_state;

// Substrate components
pub mod batch;
pub mod cache;
pub mod conflict;
pub mod engine;
pub mod hub;
pub mod receive;
pub mod storage;

#[cfg(feature = "transport-http")]
pub mod transport;

pub use config::{ConfigError, ExchangeConfig};
pub use conflict::{
    ConflictDetector, ConflictId, ConflictKind, ConflictRecord, ConflictResolver, ConflictStatus,
    ResolutionDetail, ResolutionStrategy,
};
pub use engine::{Exchange, HealthReport, KnowledgeRouter, PipelineSnapshot, PipelineStats};
pub use error::{ExchangeError, ExchangeResult, ValidationError};
pub use freshness::{FreshnessModel, HalfLifeTable};
pub use hub::{Backoff, NotificationEvent, NotificationHub, Subscription};
pub use knowledge::{ItemState, KnowledgeId, KnowledgeItem, KnowledgeType, NewKnowledge, Urgency};
pub use query::QueryFilter;
pub use receive::{EventSource, HandlerRegistry, KnowledgeHandler, KnowledgeReceiver};
pub use storage::{InMemoryStore, Mutation, StorageError, Store, Transaction};
pub use time::{Clock, ManualClock, SystemClock};
pub use worker_state::WorkerKnowledgeState;
