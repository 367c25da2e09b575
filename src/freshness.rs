//! Freshness: time-decayed relevance.
//!
//! `freshness(urgency, age) = exp(-age / half_life(urgency))`
//!
//! The score is never stored. It is computed at query time from the item's urgency
//! class and `created_at`, so the same item ranks differently as it ages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::knowledge::{KnowledgeItem, Urgency};

/// Decay time constants per urgency class, in seconds.
///
/// Critical knowledge goes stale fastest, low-urgency knowledge slowest. The values
/// are tuning knobs; only positivity is enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalfLifeTable {
    /// Low urgency.
    pub low_secs: f64,
    /// Normal urgency.
    pub normal_secs: f64,
    /// High urgency.
    pub high_secs: f64,
    /// Critical urgency.
    pub critical_secs: f64,
}

impl Default for HalfLifeTable {
    fn default() -> Self {
        Self {
            low_secs: 24.0 * 3600.0,
            normal_secs: 6.0 * 3600.0,
            high_secs: 3600.0,
            critical_secs: 15.0 * 60.0,
        }
    }
}

impl HalfLifeTable {
    /// Half-life for an urgency class, in seconds.
    #[must_use]
    pub fn half_life_secs(&self, urgency: Urgency) -> f64 {
        match urgency {
            Urgency::Low => self.low_secs,
            Urgency::Normal => self.normal_secs,
            Urgency::High => self.high_secs,
            Urgency::Critical => self.critical_secs,
        }
    }

    /// Rejects non-positive or non-finite entries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, v) in [
            ("freshness.low_secs", self.low_secs),
            ("freshness.normal_secs", self.normal_secs),
            ("freshness.high_secs", self.high_secs),
            ("freshness.critical_secs", self.critical_secs),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(ConfigError::invalid(field, format!("half-life must be > 0, got {v}")));
            }
        }
        Ok(())
    }
}

/// Pure freshness function over a half-life table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreshnessModel {
    table: HalfLifeTable,
}

impl FreshnessModel {
    /// Creates a model over `table`.
    #[must_use]
    pub fn new(table: HalfLifeTable) -> Self {
        Self { table }
    }

    /// The underlying table.
    #[must_use]
    pub fn table(&self) -> &HalfLifeTable {
        &self.table
    }

    /// Score in `[0, 1]` for an item of `urgency` that is `age_secs` old.
    ///
    /// Negative ages (clock skew between producer and reader) count as zero.
    #[must_use]
    pub fn freshness(&self, urgency: Urgency, age_secs: f64) -> f64 {
        if age_secs.is_nan() || age_secs <= 0.0 {
            return 1.0;
        }
        let half_life = self.table.half_life_secs(urgency);
        if !half_life.is_finite() || half_life <= 0.0 {
            return 0.0;
        }
        (-age_secs / half_life).exp().clamp(0.0, 1.0)
    }

    /// Score of `item` as observed at `now`.
    #[must_use]
    pub fn freshness_at(&self, item: &KnowledgeItem, now: DateTime<Utc>) -> f64 {
        self.freshness(item.urgency, age_secs(item.created_at, now))
    }
}

/// Age in fractional seconds, millisecond resolution.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn age_secs(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - created_at).num_milliseconds() as f64 / 1000.0
}
