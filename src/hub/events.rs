//! Events pushed to workers, and messages workers send back.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::ConflictRecord;
use crate::knowledge::{KnowledgeId, KnowledgeType};

/// Event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A flushed batch of new items.
    KnowledgePublished,
    /// A new conflict record.
    ConflictDetected,
    /// A conflict record reached a settled state.
    ConflictResolved,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KnowledgePublished => write!(f, "knowledge_published"),
            Self::ConflictDetected => write!(f, "conflict_detected"),
            Self::ConflictResolved => write!(f, "conflict_resolved"),
        }
    }
}

/// Body of a `knowledge_published` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedBatch {
    /// Producer of every item in the batch.
    pub producer_id: String,
    /// Type of every item in the batch.
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,
    /// Items in publish order.
    pub item_ids: Vec<KnowledgeId>,
}

/// Wire envelope: `{type, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Kind-specific body.
    pub data: Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// One event for a whole flushed batch.
    #[must_use]
    pub fn knowledge_published(batch: &PublishedBatch, at: DateTime<Utc>) -> Self {
        Self {
            event_type: EventType::KnowledgePublished,
            data: serde_json::to_value(batch).unwrap_or(Value::Null),
            timestamp: at,
        }
    }

    /// A record was created.
    #[must_use]
    pub fn conflict_detected(record: &ConflictRecord, at: DateTime<Utc>) -> Self {
        Self {
            event_type: EventType::ConflictDetected,
            data: serde_json::to_value(record).unwrap_or(Value::Null),
            timestamp: at,
        }
    }

    /// A record was resolved, failed or parked for manual review.
    #[must_use]
    pub fn conflict_resolved(record: &ConflictRecord, at: DateTime<Utc>) -> Self {
        Self {
            event_type: EventType::ConflictResolved,
            data: serde_json::to_value(record).unwrap_or(Value::Null),
            timestamp: at,
        }
    }

    /// Decodes the body of a `knowledge_published` event.
    #[must_use]
    pub fn published_batch(&self) -> Option<PublishedBatch> {
        if self.event_type != EventType::KnowledgePublished {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Decodes the record carried by conflict events.
    #[must_use]
    pub fn conflict_record(&self) -> Option<ConflictRecord> {
        match self.event_type {
            EventType::ConflictDetected | EventType::ConflictResolved => {
                serde_json::from_value(self.data.clone()).ok()
            }
            EventType::KnowledgePublished => None,
        }
    }
}

/// Messages a connected client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness signal.
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let batch = PublishedBatch {
            producer_id: "w1".to_string(),
            knowledge_type: KnowledgeType::RiskPattern,
            item_ids: vec![KnowledgeId::new(), KnowledgeId::new()],
        };
        let event = NotificationEvent::knowledge_published(&batch, Utc::now());
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "knowledge_published");
        assert_eq!(v["data"]["producerId"], "w1");
        assert_eq!(v["data"]["type"], "risk_pattern");
        assert!(v["timestamp"].is_string());
        assert_eq!(event.published_batch(), Some(batch));
        assert!(event.conflict_record().is_none());
    }

    #[test]
    fn heartbeat_message_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Heartbeat);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }
}
