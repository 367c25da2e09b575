//! Query filters and result ranking.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::freshness::FreshnessModel;
use crate::knowledge::{KnowledgeItem, KnowledgeType, Urgency};

/// Default number of results.
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// Hard ceiling on results per query.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Recognized query options.
///
/// All options are conjunctive; `types` is OR-matched within itself. An empty
/// `types` set means every type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryFilter {
    /// Accepted types (empty = all).
    pub types: BTreeSet<KnowledgeType>,
    /// Minimum freshness computed at query time.
    pub min_freshness: Option<f64>,
    /// Exact urgency match.
    pub urgency: Option<Urgency>,
    /// Exact producer match.
    pub source_worker: Option<String>,
    /// Maximum results (default 10, max 1000).
    pub limit: Option<usize>,
    /// Audit mode: include merged and deprecated items.
    pub include_inactive: bool,
}

impl QueryFilter {
    /// An unrestricted filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an accepted type.
    #[must_use]
    pub fn with_type(mut self, t: KnowledgeType) -> Self {
        self.types.insert(t);
        self
    }

    /// Sets the minimum freshness.
    #[must_use]
    pub fn min_freshness(mut self, min: f64) -> Self {
        self.min_freshness = Some(min);
        self
    }

    /// Sets the exact urgency.
    #[must_use]
    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    /// Sets the exact producer.
    #[must_use]
    pub fn source_worker(mut self, worker: impl Into<String>) -> Self {
        self.source_worker = Some(worker.into());
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Enables audit mode.
    #[must_use]
    pub fn include_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    /// Checks option ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_QUERY_LIMIT {
                return Err(ValidationError::LimitOutOfRange {
                    limit,
                    max: MAX_QUERY_LIMIT,
                });
            }
        }
        if let Some(min) = self.min_freshness {
            if !(0.0..=1.0).contains(&min) {
                return Err(ValidationError::FreshnessOutOfRange { value: min });
            }
        }
        Ok(())
    }

    /// The limit that will actually be applied.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).clamp(1, MAX_QUERY_LIMIT)
    }

    /// True if results of this filter can contain items of `t`.
    #[must_use]
    pub fn mentions_type(&self, t: KnowledgeType) -> bool {
        self.types.is_empty() || self.types.contains(&t)
    }

    /// Returns true if `item` passes every option except the freshness floor.
    #[must_use]
    pub fn admits(&self, item: &KnowledgeItem) -> bool {
        if !self.include_inactive && !item.is_active() {
            return false;
        }
        if !self.mentions_type(item.knowledge_type) {
            return false;
        }
        if self.urgency.is_some_and(|u| u != item.urgency) {
            return false;
        }
        if let Some(worker) = &self.source_worker {
            if *worker != item.producer_id {
                return false;
            }
        }
        true
    }
}

/// Filters, scores and orders candidate items for `filter` as observed at `now`.
///
/// Order: `priority` desc, freshness desc, `created_at` desc, then publish sequence
/// desc and id asc so that identical inputs always produce identical output.
#[must_use]
pub fn rank(
    candidates: Vec<KnowledgeItem>,
    filter: &QueryFilter,
    model: &FreshnessModel,
    now: DateTime<Utc>,
) -> Vec<KnowledgeItem> {
    let min = filter.min_freshness.unwrap_or(0.0);
    let mut scored: Vec<(f64, KnowledgeItem)> = candidates
        .into_iter()
        .filter(|item| filter.admits(item))
        .map(|item| (model.freshness_at(&item, now), item))
        .filter(|(f, _)| *f >= min)
        .collect();

    scored.sort_by(|(fa, a), (fb, b)| compare_ranked(*fa, a, *fb, b));
    scored.truncate(filter.effective_limit());
    scored.into_iter().map(|(_, item)| item).collect()
}

fn compare_ranked(fa: f64, a: &KnowledgeItem, fb: f64, b: &KnowledgeItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| fb.total_cmp(&fa))
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.sequence.cmp(&a.sequence))
        .then_with(|| a.id.cmp(&b.id))
}
