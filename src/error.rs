//! Error types for the exchange.
//!
//! Errors are strongly typed using thiserror. Only validation errors ever reach a
//! publisher; everything downstream of `publish` degrades to logging plus retained
//! state (failed conflict records, stats counters).

use thiserror::Error;

use crate::config::ConfigError;
use crate::conflict::ConflictId;
use crate::knowledge::{KnowledgeId, KnowledgeType};
use crate::storage::StorageError;

/// Validation errors for input to publish, query and resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Unknown knowledge type '{value}'")]
    UnknownKnowledgeType {
        value: String,
    },

    #[error("Knowledge type '{knowledge_type}' is not accepted by this router")]
    KnowledgeTypeNotAccepted {
        knowledge_type: KnowledgeType,
    },

    #[error("Unknown urgency '{value}'")]
    UnknownUrgency {
        value: String,
    },

    #[error("Unknown conflict status '{value}'")]
    UnknownConflictStatus {
        value: String,
    },

    #[error("Unknown resolution strategy '{value}'")]
    UnknownStrategy {
        value: String,
    },

    #[error("Producer id cannot be empty")]
    EmptyProducerId,

    #[error("Payload is {size} bytes, maximum is {max}")]
    PayloadTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Query limit {limit} is out of range [1, {max}]")]
    LimitOutOfRange {
        limit: usize,
        max: usize,
    },

    #[error("Minimum freshness {value} is out of range [0.0, 1.0]")]
    FreshnessOutOfRange {
        value: f64,
    },

    #[error("Invalid identifier '{value}'")]
    InvalidId {
        value: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("No handler registered for knowledge types: {}", format_types(.missing))]
    MissingHandlers {
        missing: Vec<KnowledgeType>,
    },
}

fn format_types(types: &[KnowledgeType]) -> String {
    types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while resolving a conflict record.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("Knowledge item {item_id} referenced by conflict {conflict_id} is missing")]
    ItemMissing {
        conflict_id: ConflictId,
        item_id: KnowledgeId,
    },

    #[error("Resolution of {conflict_id} timed out waiting for an in-flight attempt")]
    InFlightTimeout {
        conflict_id: ConflictId,
    },

    #[error("Storage error during resolution: {0}")]
    Storage(#[from] StorageError),
}

impl ResolutionError {
    /// Returns true if a later attempt might succeed without operator action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::InFlightTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Notification delivery errors.
///
/// These never reach a publisher. The hub reacts by dropping the connection and
/// queueing the event for the worker's next connect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Connection {connection_id} is closed")]
    ConnectionClosed {
        connection_id: String,
    },

    #[error("Connection {connection_id} buffer is full")]
    ConnectionFull {
        connection_id: String,
    },

    #[error("Notification hub is not accepting connections")]
    HubClosed,
}

/// Top-level error type for the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ExchangeError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error names a missing record.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Resolution(ResolutionError::ConflictNotFound(_))
                | Self::Storage(StorageError::ItemNotFound(_) | StorageError::ConflictNotFound(_))
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Internal { .. } => false,
            Self::Storage(e) => e.is_transient(),
            Self::Resolution(e) => e.is_retryable(),
            Self::Delivery(e) => !matches!(e, DeliveryError::HubClosed),
        }
    }
}

/// Result type alias for exchange operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
