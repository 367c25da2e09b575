//! Knowledge items: the unit of exchange between workers.
//!
//! An item is created once by `publish` and never deleted. Conflict resolution
//! may later flip its lifecycle flag to `merged` or `deprecated`, which hides it
//! from normal queries while keeping it around for audit and replay.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Unique identifier for a knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeId(Uuid);

impl KnowledgeId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for KnowledgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for KnowledgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for KnowledgeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ValidationError::InvalidId { value: s.to_string() })
    }
}

/// Knowledge categories workers exchange.
///
/// New categories are added as variants; the wire form is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    /// A code shape that has been associated with breakage.
    RiskPattern,
    /// A reusable code pattern a worker learned.
    CodePattern,
    /// The outcome of a proposed change (accepted, rejected, reverted).
    ProposalOutcome,
    /// A decision taken by a worker or committee.
    DecisionMade,
    /// A measured performance observation.
    PerformanceInsight,
    /// Root-cause notes for a failed attempt.
    FailureAnalysis,
}

impl KnowledgeType {
    /// Every known type, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::RiskPattern,
        Self::CodePattern,
        Self::ProposalOutcome,
        Self::DecisionMade,
        Self::PerformanceInsight,
        Self::FailureAnalysis,
    ];

    /// The wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RiskPattern => "risk_pattern",
            Self::CodePattern => "code_pattern",
            Self::ProposalOutcome => "proposal_outcome",
            Self::DecisionMade => "decision_made",
            Self::PerformanceInsight => "performance_insight",
            Self::FailureAnalysis => "failure_analysis",
        }
    }
}

impl fmt::Display for KnowledgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnowledgeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ValidationError::UnknownKnowledgeType {
                value: s.to_string(),
            })
    }
}

/// Coarse urgency class; selects the freshness half-life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Slowest decay.
    Low,
    /// Default class.
    #[default]
    Normal,
    /// Faster decay.
    High,
    /// Fastest decay.
    Critical,
}

impl Urgency {
    /// The wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(ValidationError::UnknownUrgency { value: s.to_string() }),
        }
    }
}

/// Lifecycle flag of a knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Visible to normal queries.
    #[default]
    Active,
    /// Folded into another item by a merge resolution.
    Merged,
    /// Superseded or discarded by a resolution.
    Deprecated,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Merged => write!(f, "merged"),
            Self::Deprecated => write!(f, "deprecated"),
        }
    }
}

/// A published unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeItem {
    /// Unique identifier, independent of the producer.
    pub id: KnowledgeId,

    /// Identity of the publishing worker.
    pub producer_id: String,

    /// Knowledge category.
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,

    /// Opaque payload; the substrate only reads its textual form.
    pub payload: serde_json::Value,

    /// Urgency class.
    pub urgency: Urgency,

    /// Query tie-break weight (higher first).
    pub priority: i32,

    /// When the item was accepted by the router.
    pub created_at: DateTime<Utc>,

    /// Router-assigned publish sequence; orders items published at the same instant.
    pub sequence: u64,

    /// Lifecycle flag.
    pub state: ItemState,

    /// Item this one was merged into (set iff `state == merged`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<KnowledgeId>,

    /// Why the item was deprecated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_reason: Option<String>,

    /// Provenance of an item created by a merge resolution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<KnowledgeId>,
}

impl KnowledgeItem {
    /// Builds an active item from a publish request.
    #[must_use]
    pub fn from_new(new: NewKnowledge, created_at: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            id: KnowledgeId::new(),
            producer_id: new.producer_id,
            knowledge_type: new.knowledge_type,
            payload: new.payload,
            urgency: new.urgency,
            priority: new.priority,
            created_at,
            sequence,
            state: ItemState::Active,
            merged_into: None,
            deprecated_reason: None,
            merged_from: Vec::new(),
        }
    }

    /// Returns true if the item is visible to normal queries.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ItemState::Active
    }

    /// Textual representation used for similarity and classification.
    ///
    /// String payloads are used verbatim; anything else is its compact JSON form.
    #[must_use]
    pub fn text(&self) -> String {
        payload_text(&self.payload)
    }

    /// Marks this item as merged into `target`.
    pub fn mark_merged(&mut self, target: KnowledgeId) {
        self.state = ItemState::Merged;
        self.merged_into = Some(target);
        self.deprecated_reason = None;
    }

    /// Marks this item as deprecated.
    pub fn mark_deprecated(&mut self, reason: impl Into<String>) {
        self.state = ItemState::Deprecated;
        self.merged_into = None;
        self.deprecated_reason = Some(reason.into());
    }

    /// Checks the `mergedInto iff merged` invariant.
    #[must_use]
    pub fn lifecycle_consistent(&self) -> bool {
        self.merged_into.is_some() == (self.state == ItemState::Merged)
    }
}

/// Textual form of a payload.
#[must_use]
pub fn payload_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Allocator for publish sequences.
///
/// Shared by the router and the resolver so that merged items are ordered after
/// every item that existed when they were created.
#[derive(Debug, Default)]
pub struct Sequencer {
    last: AtomicU64,
}

impl Sequencer {
    /// Starts after the highest sequence already stored.
    #[must_use]
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    /// Allocates the next sequence.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Most recently allocated sequence.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// A publish request, as produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKnowledge {
    /// Identity of the publishing worker.
    pub producer_id: String,

    /// Knowledge category.
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Urgency class.
    #[serde(default)]
    pub urgency: Urgency,

    /// Query tie-break weight.
    #[serde(default)]
    pub priority: i32,
}

impl NewKnowledge {
    /// Creates a normal-urgency, zero-priority request.
    #[must_use]
    pub fn new(
        producer_id: impl Into<String>,
        knowledge_type: KnowledgeType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            knowledge_type,
            payload,
            urgency: Urgency::Normal,
            priority: 0,
        }
    }

    /// Sets the urgency class.
    #[must_use]
    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Size of the payload in its serialized form.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map_or(usize::MAX, |v| v.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn knowledge_type_parses_wire_names() {
        for t in KnowledgeType::ALL {
            assert_eq!(t.as_str().parse::<KnowledgeType>().unwrap(), t);
        }
        assert_eq!(
            " Risk_Pattern ".parse::<KnowledgeType>().unwrap(),
            KnowledgeType::RiskPattern
        );
        assert!(matches!(
            "gossip".parse::<KnowledgeType>(),
            Err(ValidationError::UnknownKnowledgeType { .. })
        ));
    }

    #[test]
    fn urgency_parse_and_order() {
        assert_eq!("CRITICAL".parse::<Urgency>().unwrap(), Urgency::Critical);
        assert!("soon".parse::<Urgency>().is_err());
        assert!(Urgency::Critical > Urgency::Low);
    }

    #[test]
    fn item_lifecycle_flags_stay_consistent() {
        let mut item = KnowledgeItem::from_new(
            NewKnowledge::new("w1", KnowledgeType::CodePattern, json!("prefer iterators")),
            Utc::now(),
            1,
        );
        assert!(item.is_active());
        assert!(item.lifecycle_consistent());

        let target = KnowledgeId::new();
        item.mark_merged(target);
        assert_eq!(item.state, ItemState::Merged);
        assert_eq!(item.merged_into, Some(target));
        assert!(item.lifecycle_consistent());

        item.mark_deprecated("superseded");
        assert_eq!(item.merged_into, None);
        assert!(item.lifecycle_consistent());
    }

    #[test]
    fn text_uses_string_payload_verbatim() {
        let item = KnowledgeItem::from_new(
            NewKnowledge::new("w1", KnowledgeType::RiskPattern, json!("Auth Is Brittle")),
            Utc::now(),
            1,
        );
        assert_eq!(item.text(), "Auth Is Brittle");
        assert_eq!(payload_text(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn item_serializes_with_wire_names() {
        let item = KnowledgeItem::from_new(
            NewKnowledge::new("w1", KnowledgeType::DecisionMade, json!({"k": "v"}))
                .urgency(Urgency::High)
                .priority(3),
            Utc::now(),
            7,
        );
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["type"], "decision_made");
        assert_eq!(v["producerId"], "w1");
        assert_eq!(v["urgency"], "high");
        assert!(v.get("mergedInto").is_none());
    }

    #[test]
    fn sequencer_resumes_after_stored_maximum() {
        let seq = Sequencer::starting_after(41);
        assert_eq!(seq.next(), 42);
        assert_eq!(seq.next(), 43);
        assert_eq!(seq.current(), 43);
    }

    #[test]
    fn knowledge_id_parse_rejects_garbage() {
        let id = KnowledgeId::new();
        assert_eq!(id.to_string().parse::<KnowledgeId>().unwrap(), id);
        assert!("nope".parse::<KnowledgeId>().is_err());
    }
}
