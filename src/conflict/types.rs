//! Conflict records.
//!
//! Conflicts are explicit objects, not hidden errors. When the detector finds two
//! items that duplicate, contradict or overlap each other it creates a record
//! that tracks the relationship and, later, how it was settled.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::knowledge::{KnowledgeId, KnowledgeType};

/// Unique identifier for a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Creates a new random conflict ID.
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

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ValidationError::InvalidId { value: s.to_string() })
    }
}

/// How two items relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Textual representations are identical.
    Duplicate,
    /// An antonym pair splits across the two items.
    Contradiction,
    /// Similar but neither identical nor contradictory.
    Overlap,
}

impl ConflictKind {
    /// Strategy applied when no policy override exists.
    #[must_use]
    pub const fn default_strategy(self) -> ResolutionStrategy {
        match self {
            Self::Duplicate => ResolutionStrategy::Merge,
            Self::Contradiction => ResolutionStrategy::Manual,
            Self::Overlap => ResolutionStrategy::Prioritize,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate"),
            Self::Contradiction => write!(f, "contradiction"),
            Self::Overlap => write!(f, "overlap"),
        }
    }
}

/// Deterministic procedure used to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Fold every input into one new item.
    Merge,
    /// Keep the newest input, deprecate the rest.
    Prioritize,
    /// Deprecate every input.
    Discard,
    /// Leave the inputs alone and wait for an operator.
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Prioritize => write!(f, "prioritize"),
            Self::Discard => write!(f, "discard"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "prioritize" => Ok(Self::Prioritize),
            "discard" => Ok(Self::Discard),
            "manual" => Ok(Self::Manual),
            _ => Err(ValidationError::UnknownStrategy { value: s.to_string() }),
        }
    }
}

/// Where a conflict record is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStatus {
    /// Detected, not yet resolved.
    Pending,
    /// Settled; `resolution_detail` describes the outcome.
    Resolved,
    /// Strategy execution failed; kept for inspection and retry.
    Failed,
    /// Waiting for an operator to pick a strategy.
    PendingManual,
}

impl ConflictStatus {
    /// Returns true for statuses that `resolve` may still act on.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Resolved)
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Failed => write!(f, "failed"),
            Self::PendingManual => write!(f, "pendingManual"),
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "failed" => Ok(Self::Failed),
            "pendingmanual" => Ok(Self::PendingManual),
            _ => Err(ValidationError::UnknownConflictStatus { value: s.to_string() }),
        }
    }
}

/// Structured explanation of a resolution outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionDetail {
    /// The inputs were folded into one item.
    #[serde(rename_all = "camelCase")]
    Merged {
        /// The item every input now points at.
        merged_item_id: KnowledgeId,
        /// The record inputs folded into it.
        merged_from: Vec<KnowledgeId>,
    },

    /// One input was kept.
    #[serde(rename_all = "camelCase")]
    Prioritized {
        /// The item left active.
        winner_id: KnowledgeId,
        /// Items deprecated in its favor.
        deprecated_ids: Vec<KnowledgeId>,
    },

    /// Every input was deprecated.
    #[serde(rename_all = "camelCase")]
    Discarded {
        /// Items deprecated.
        deprecated_ids: Vec<KnowledgeId>,
    },

    /// Other resolutions already settled the inputs; nothing was mutated.
    #[serde(rename_all = "camelCase")]
    Superseded {
        /// Items of the record still active at resolution time.
        remaining: Vec<KnowledgeId>,
    },

    /// No mutation; waiting for an operator.
    AwaitingManual,

    /// Strategy execution failed.
    #[serde(rename_all = "camelCase")]
    Failed {
        /// Captured error.
        error: String,
        /// Strategy that was attempted.
        strategy: ResolutionStrategy,
    },
}

/// A detected relationship between two or more knowledge items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Unique identifier.
    pub id: ConflictId,

    /// Involved items (at least two).
    pub item_ids: Vec<KnowledgeId>,

    /// Relationship kind.
    pub kind: ConflictKind,

    /// Similarity score in `[0, 1]`.
    pub similarity: f64,

    /// When the detector created the record.
    pub detected_at: DateTime<Utc>,

    /// Strategy to apply (defaulted by kind unless overridden).
    pub strategy: ResolutionStrategy,

    /// Lifecycle status.
    pub status: ConflictStatus,

    /// Outcome explanation, set once resolution ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_detail: Option<ResolutionDetail>,

    /// When the record reached `resolved`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Knowledge type shared by the involved items; backs the `(type, status)` index.
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,

    /// Number of resolution attempts made so far.
    #[serde(default)]
    pub attempts: u32,
}

impl ConflictRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn new(
        item_ids: Vec<KnowledgeId>,
        knowledge_type: KnowledgeType,
        kind: ConflictKind,
        similarity: f64,
        strategy: ResolutionStrategy,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            item_ids,
            kind,
            similarity: similarity.clamp(0.0, 1.0),
            detected_at,
            strategy,
            status: ConflictStatus::Pending,
            resolution_detail: None,
            resolved_at: None,
            knowledge_type,
            attempts: 0,
        }
    }

    /// Returns true if the record involves `item`.
    #[must_use]
    pub fn involves(&self, item: KnowledgeId) -> bool {
        self.item_ids.contains(&item)
    }

    /// Returns true once resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_defaults() {
        assert_eq!(ConflictKind::Duplicate.default_strategy(), ResolutionStrategy::Merge);
        assert_eq!(ConflictKind::Contradiction.default_strategy(), ResolutionStrategy::Manual);
        assert_eq!(ConflictKind::Overlap.default_strategy(), ResolutionStrategy::Prioritize);
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_value(ConflictStatus::PendingManual).unwrap(),
            "pendingManual"
        );
        assert_eq!("pending_manual".parse::<ConflictStatus>().unwrap(), ConflictStatus::PendingManual);
        assert_eq!("pendingManual".parse::<ConflictStatus>().unwrap(), ConflictStatus::PendingManual);
        assert!("open".parse::<ConflictStatus>().is_err());
    }

    #[test]
    fn strategy_parse() {
        assert_eq!(" Merge ".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Merge);
        assert!(matches!(
            "vote".parse::<ResolutionStrategy>(),
            Err(ValidationError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn record_serializes_detail_with_outcome_tag() {
        let a = KnowledgeId::new();
        let b = KnowledgeId::new();
        let mut record = ConflictRecord::new(
            vec![a, b],
            KnowledgeType::RiskPattern,
            ConflictKind::Overlap,
            0.9,
            ResolutionStrategy::Prioritize,
            Utc::now(),
        );
        record.resolution_detail = Some(ResolutionDetail::Prioritized {
            winner_id: b,
            deprecated_ids: vec![a],
        });
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["resolutionDetail"]["outcome"], "prioritized");
        assert_eq!(v["resolutionDetail"]["winnerId"], b.to_string());
        assert_eq!(v["status"], "pending");
        assert_eq!(v["type"], "risk_pattern");
        assert!(record.involves(a));
    }
}
