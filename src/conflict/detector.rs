//! Conflict detection.
//!
//! For every newly persisted item the detector looks back over a bounded window
//! of active items from the same producer and of the same type, and pairs the
//! new item with the earliest sufficiently similar one. Each new item therefore
//! produces at most one record, always against the oldest match in the window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::knowledge::KnowledgeItem;
use crate::storage::{StorageError, Store};

use super::similarity::{AntonymTable, JaccardSimilarity, SimilarityFn, DEFAULT_ANTONYM_PAIRS};
use super::types::{ConflictKind, ConflictRecord, ResolutionStrategy};

/// Policy overrides for the strategy chosen per conflict kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyOverrides {
    /// Strategy for duplicates (default merge).
    pub duplicate: Option<ResolutionStrategy>,
    /// Strategy for contradictions (default manual).
    pub contradiction: Option<ResolutionStrategy>,
    /// Strategy for overlaps (default prioritize).
    pub overlap: Option<ResolutionStrategy>,
}

impl StrategyOverrides {
    /// Strategy for `kind` after applying overrides.
    #[must_use]
    pub fn strategy_for(&self, kind: ConflictKind) -> ResolutionStrategy {
        let custom = match kind {
            ConflictKind::Duplicate => self.duplicate,
            ConflictKind::Contradiction => self.contradiction,
            ConflictKind::Overlap => self.overlap,
        };
        custom.unwrap_or_else(|| kind.default_strategy())
    }
}

/// Detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// How far back (from the new item's `created_at`) candidates are considered.
    pub lookback_secs: u64,
    /// Minimum similarity for a conflict.
    pub similarity_threshold: f64,
    /// Per-kind strategy overrides.
    pub strategy_overrides: StrategyOverrides,
    /// Opposite-term pairs used to spot contradictions.
    pub antonym_pairs: Vec<(String, String)>,
    /// Upper bound on candidates compared per item.
    pub max_candidates: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 300,
            similarity_threshold: 0.85,
            strategy_overrides: StrategyOverrides::default(),
            antonym_pairs: DEFAULT_ANTONYM_PAIRS
                .iter()
                .map(|(l, r)| ((*l).to_string(), (*r).to_string()))
                .collect(),
            max_candidates: 256,
        }
    }
}

impl DetectorConfig {
    /// Checks ranges and that every antonym term compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_secs == 0 {
            return Err(ConfigError::invalid("detector.lookback_secs", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::invalid(
                "detector.similarity_threshold",
                format!("must be within [0, 1], got {}", self.similarity_threshold),
            ));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::invalid("detector.max_candidates", "must be > 0"));
        }
        if self
            .antonym_pairs
            .iter()
            .any(|(l, r)| l.trim().is_empty() || r.trim().is_empty())
        {
            return Err(ConfigError::invalid("detector.antonym_pairs", "terms must not be empty"));
        }
        AntonymTable::new(self.antonym_pairs.iter().map(|(l, r)| (l.as_str(), r.as_str())))
            .map_err(|e| ConfigError::invalid("detector.antonym_pairs", e.to_string()))?;
        Ok(())
    }
}

/// Outcome of comparing two items.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Relationship kind.
    pub kind: ConflictKind,
    /// Similarity score.
    pub similarity: f64,
}

/// Proposes conflict records for newly persisted items.
#[derive(Debug)]
pub struct ConflictDetector {
    config: DetectorConfig,
    similarity: Arc<dyn SimilarityFn>,
    antonyms: AntonymTable,
}

impl ConflictDetector {
    /// Creates a detector with the Jaccard baseline.
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let antonyms = AntonymTable::new(config.antonym_pairs.iter().map(|(l, r)| (l.as_str(), r.as_str())))
            .map_err(|e| ConfigError::invalid("detector.antonym_pairs", e.to_string()))?;
        Ok(Self {
            config,
            similarity: Arc::new(JaccardSimilarity),
            antonyms,
        })
    }

    /// Replaces the similarity function.
    #[must_use]
    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityFn>) -> Self {
        self.similarity = similarity;
        self
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Compares two items; `None` when they are not similar enough to conflict.
    #[must_use]
    pub fn classify(&self, a: &KnowledgeItem, b: &KnowledgeItem) -> Option<Classification> {
        let a_text = a.text();
        let b_text = b.text();
        let similarity = self.similarity.similarity(&a_text, &b_text).clamp(0.0, 1.0);
        if similarity < self.config.similarity_threshold {
            return None;
        }
        let kind = if a_text == b_text {
            ConflictKind::Duplicate
        } else if self.antonyms.contradicts(&a_text, &b_text) {
            ConflictKind::Contradiction
        } else {
            ConflictKind::Overlap
        };
        Some(Classification { kind, similarity })
    }

    /// Finds the conflict, if any, that `item` forms with the items published
    /// before it. Never mutates the store.
    pub fn detect(
        &self,
        store: &dyn Store,
        item: &KnowledgeItem,
        detected_at: DateTime<Utc>,
    ) -> Result<Option<ConflictRecord>, StorageError> {
        if !item.is_active() {
            return Ok(None);
        }
        let lookback = Duration::seconds(i64::try_from(self.config.lookback_secs).unwrap_or(i64::MAX));
        let since = item
            .created_at
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let candidates = store.find_by_producer_type(&item.producer_id, item.knowledge_type, since)?;
        let found = candidates
            .iter()
            .filter(|c| c.id != item.id && c.is_active() && c.sequence < item.sequence)
            .filter(|c| c.created_at <= item.created_at)
            .take(self.config.max_candidates)
            .find_map(|c| self.classify(c, item).map(|class| (c, class)));

        Ok(found.map(|(candidate, class)| {
            tracing::debug!(
                item_id = %item.id,
                candidate_id = %candidate.id,
                kind = %class.kind,
                similarity = class.similarity,
                "conflict detected"
            );
            ConflictRecord::new(
                vec![candidate.id, item.id],
                item.knowledge_type,
                class.kind,
                class.similarity,
                self.config.strategy_overrides.strategy_for(class.kind),
                detected_at,
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{KnowledgeType, NewKnowledge};
    use crate::storage::{InMemoryStore, Transaction};
    use serde_json::json;

    fn item(producer: &str, text: &str, at: DateTime<Utc>, seq: u64) -> KnowledgeItem {
        KnowledgeItem::from_new(
            NewKnowledge::new(producer, KnowledgeType::RiskPattern, json!(text)),
            at,
            seq,
        )
    }

    fn persist(store: &InMemoryStore, items: &[&KnowledgeItem]) {
        let tx = items
            .iter()
            .fold(Transaction::new(), |tx, i| tx.insert_item((*i).clone()));
        store.apply(tx).unwrap();
    }

    const TEXT: &str = "the session refresh path drops tokens under concurrent load in auth";

    #[test]
    fn identical_payloads_are_duplicates_with_full_similarity() {
        let store = InMemoryStore::new();
        let detector = ConflictDetector::new(DetectorConfig::default()).unwrap();
        let t0 = Utc::now();
        let a = item("w1", TEXT, t0, 1);
        let b = item("w1", TEXT, t0 + Duration::seconds(1), 2);
        persist(&store, &[&a, &b]);

        let record = detector.detect(&store, &b, Utc::now()).unwrap().unwrap();
        assert_eq!(record.kind, ConflictKind::Duplicate);
        assert!((record.similarity - 1.0).abs() < f64::EPSILON);
        assert_eq!(record.item_ids, vec![a.id, b.id]);
        assert_eq!(record.strategy, ResolutionStrategy::Merge);
    }

    #[test]
    fn contradiction_defaults_to_manual() {
        let detector = ConflictDetector::new(DetectorConfig::default()).unwrap();
        let t0 = Utc::now();
        let a = item("w1", "workers should retry flaky integration tests before reporting a failure", t0, 1);
        let b = item("w1", "workers should not retry flaky integration tests before reporting a failure", t0, 2);
        let class = detector.classify(&a, &b).unwrap();
        assert_eq!(class.kind, ConflictKind::Contradiction);
        assert_eq!(
            DetectorConfig::default().strategy_overrides.strategy_for(class.kind),
            ResolutionStrategy::Manual
        );
    }

    #[test]
    fn near_identical_is_overlap_and_honors_override() {
        let mut config = DetectorConfig::default();
        config.strategy_overrides.overlap = Some(ResolutionStrategy::Discard);
        let store = InMemoryStore::new();
        let detector = ConflictDetector::new(config).unwrap();
        let t0 = Utc::now();
        let a = item("w1", "cache eviction in the query layer thrashes when ttl is tiny and capacity small", t0, 1);
        let b = item("w1", "cache eviction in the query layer thrashes when ttl is tiny and capacity small!", t0, 2);
        persist(&store, &[&a, &b]);

        let record = detector.detect(&store, &b, t0).unwrap().unwrap();
        assert_eq!(record.kind, ConflictKind::Overlap);
        assert_eq!(record.strategy, ResolutionStrategy::Discard);
    }

    #[test]
    fn other_producers_and_old_items_are_ignored() {
        let store = InMemoryStore::new();
        let detector = ConflictDetector::new(DetectorConfig::default()).unwrap();
        let t0 = Utc::now();
        let old = item("w1", TEXT, t0 - Duration::minutes(10), 1);
        let foreign = item("w2", TEXT, t0, 2);
        let fresh = item("w1", TEXT, t0, 3);
        persist(&store, &[&old, &foreign, &fresh]);

        assert!(detector.detect(&store, &fresh, t0).unwrap().is_none());
    }

    #[test]
    fn three_near_identical_items_pair_against_the_first() {
        let store = InMemoryStore::new();
        let detector = ConflictDetector::new(DetectorConfig::default()).unwrap();
        let t0 = Utc::now();
        let a = item("w1", TEXT, t0, 1);
        let b = item("w1", TEXT, t0 + Duration::seconds(1), 2);
        let c = item("w1", TEXT, t0 + Duration::seconds(2), 3);
        persist(&store, &[&a, &b, &c]);

        let records: Vec<_> = [&a, &b, &c]
            .iter()
            .filter_map(|i| detector.detect(&store, i, t0).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.item_ids[0] == a.id));
    }

    #[test]
    fn dissimilar_items_do_not_conflict() {
        let detector = ConflictDetector::new(DetectorConfig::default()).unwrap();
        let t0 = Utc::now();
        let a = item("w1", "auth module is brittle", t0, 1);
        let b = item("w1", "the scheduler starves low priority jobs", t0, 2);
        assert!(detector.classify(&a, &b).is_none());
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let config = DetectorConfig {
            similarity_threshold: -0.1,
            ..DetectorConfig::default()
        };
        assert!(ConflictDetector::new(config).is_err());
    }
}
