//! Per-worker exchange accounting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::knowledge::KnowledgeType;

/// Running counters for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerKnowledgeState {
    /// Worker identity.
    pub worker_id: String,

    /// Last time the worker received an item of each type.
    #[serde(default)]
    pub last_seen_at: BTreeMap<KnowledgeType, DateTime<Utc>>,

    /// Items the worker published that reached the store.
    pub published: u64,

    /// Items delivered to the worker's handlers.
    pub received: u64,

    /// Conflict records involving one of the worker's items.
    pub conflicts_involved: u64,

    /// First contact.
    pub first_seen_at: DateTime<Utc>,

    /// Most recent update of any counter.
    pub updated_at: DateTime<Utc>,
}

impl WorkerKnowledgeState {
    /// Creates a zeroed state on first contact.
    #[must_use]
    pub fn new(worker_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            last_seen_at: BTreeMap::new(),
            published: 0,
            received: 0,
            conflicts_involved: 0,
            first_seen_at: at,
            updated_at: at,
        }
    }

    /// Applies a counter delta.
    pub fn apply(&mut self, delta: &WorkerDelta) {
        self.published = self.published.saturating_add(delta.published);
        self.received = self.received.saturating_add(delta.received);
        self.conflicts_involved = self.conflicts_involved.saturating_add(delta.conflicts_involved);
        for (t, at) in &delta.seen {
            let slot = self.last_seen_at.entry(*t).or_insert(*at);
            if *at > *slot {
                *slot = *at;
            }
        }
        if delta.at > self.updated_at {
            self.updated_at = delta.at;
        }
    }
}

/// An additive change to a worker's counters, applied inside a store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDelta {
    /// Published items to add.
    #[serde(default)]
    pub published: u64,
    /// Received items to add.
    #[serde(default)]
    pub received: u64,
    /// Conflicts to add.
    #[serde(default)]
    pub conflicts_involved: u64,
    /// Types seen and when.
    #[serde(default)]
    pub seen: Vec<(KnowledgeType, DateTime<Utc>)>,
    /// When the delta was produced.
    pub at: DateTime<Utc>,
}

impl WorkerDelta {
    /// An empty delta stamped at `at`.
    #[must_use]
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            published: 0,
            received: 0,
            conflicts_involved: 0,
            seen: Vec::new(),
            at,
        }
    }

    /// Adds published items.
    #[must_use]
    pub fn published(mut self, n: u64) -> Self {
        self.published = self.published.saturating_add(n);
        self
    }

    /// Adds received items of one type.
    #[must_use]
    pub fn received(mut self, knowledge_type: KnowledgeType, n: u64) -> Self {
        self.received = self.received.saturating_add(n);
        self.seen.push((knowledge_type, self.at));
        self
    }

    /// Adds conflicts.
    #[must_use]
    pub fn conflicts(mut self, n: u64) -> Self {
        self.conflicts_involved = self.conflicts_involved.saturating_add(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn delta_accumulates_and_keeps_latest_seen() {
        let t0 = Utc::now();
        let mut state = WorkerKnowledgeState::new("w1", t0);

        state.apply(&WorkerDelta::at(t0).published(3));
        state.apply(&WorkerDelta::at(t0 + Duration::seconds(5)).received(KnowledgeType::RiskPattern, 2));
        state.apply(&WorkerDelta::at(t0 + Duration::seconds(1)).received(KnowledgeType::RiskPattern, 1));
        state.apply(&WorkerDelta::at(t0).conflicts(1));

        assert_eq!(state.published, 3);
        assert_eq!(state.received, 3);
        assert_eq!(state.conflicts_involved, 1);
        assert_eq!(
            state.last_seen_at.get(&KnowledgeType::RiskPattern),
            Some(&(t0 + Duration::seconds(5)))
        );
        assert_eq!(state.updated_at, t0 + Duration::seconds(5));
    }

    #[test]
    fn state_serializes_type_keyed_map() {
        let t0 = Utc::now();
        let mut state = WorkerKnowledgeState::new("w1", t0);
        state.apply(&WorkerDelta::at(t0).received(KnowledgeType::DecisionMade, 1));
        let v = serde_json::to_value(&state).unwrap();
        assert!(v["lastSeenAt"].get("decision_made").is_some());
        let back: WorkerKnowledgeState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }
}
