//! Query result cache.
//!
//! Keys are BLAKE3 digests of the requesting worker and the canonical JSON form
//! of the filter. Entries live for `ttl_ms` and are evicted oldest-first once
//! `capacity` is reached. Flushes invalidate every entry whose filter could
//! contain the flushed types.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::knowledge::{KnowledgeItem, KnowledgeType};
use crate::query::QueryFilter;
use crate::time::{elapsed_ms, Clock};

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serve repeated queries from memory.
    pub enabled: bool,
    /// Entry lifetime.
    pub ttl_ms: u64,
    /// Maximum entries.
    pub capacity: usize,
    /// Period of the background expiry sweep.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 2000,
            capacity: 1024,
            sweep_interval_ms: 5000,
        }
    }
}

impl CacheConfig {
    /// Checks ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.ttl_ms == 0 {
            return Err(ConfigError::invalid("cache.ttl_ms", "must be > 0"));
        }
        if self.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::invalid("cache.sweep_interval_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Stable cache key.
pub type CacheKey = blake3::Hash;

/// Computes the key for a query issued by `worker` (anonymous when `None`).
#[must_use]
pub fn cache_key(worker: Option<&str>, filter: &QueryFilter) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    let worker = worker.unwrap_or("");
    hasher.update(&(worker.len() as u64).to_le_bytes());
    hasher.update(worker.as_bytes());
    // Field order is fixed by the struct and `types` is a sorted set.
    let canonical = serde_json::to_vec(filter).unwrap_or_default();
    hasher.update(&canonical);
    hasher.finalize()
}

#[derive(Debug)]
struct Entry {
    types: BTreeSet<KnowledgeType>,
    stored_at: DateTime<Utc>,
    generation: u64,
    items: Vec<KnowledgeItem>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    by_age: BTreeMap<u64, CacheKey>,
    next_generation: u64,
    invalidations: BTreeMap<KnowledgeType, u64>,
    cleared: u64,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.by_age.remove(&entry.generation);
        Some(entry)
    }

    fn epoch(&self, types: &BTreeSet<KnowledgeType>) -> u64 {
        let touched: u64 = if types.is_empty() {
            self.invalidations.values().sum()
        } else {
            types.iter().filter_map(|t| self.invalidations.get(t)).sum()
        };
        self.cleared + touched
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to the store.
    pub misses: u64,
    /// Live entries.
    pub entries: usize,
}

/// TTL cache in front of store reads.
#[derive(Debug)]
pub struct QueryCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        elapsed_ms(entry.stored_at, now) < self.config.ttl_ms
    }

    /// Returns the cached result for `key` if it is still valid.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<KnowledgeItem>> {
        if !self.config.enabled {
            return None;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        let live = state.entries.get(key).map(|e| self.is_live(e, now));
        match live {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                state.entries.get(key).map(|e| e.items.clone())
            }
            Some(false) => {
                state.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Invalidation counter for the types `filter` can return.
    ///
    /// Read it before computing a result and hand it back to [`Self::put`].
    #[must_use]
    pub fn epoch(&self, filter: &QueryFilter) -> u64 {
        self.lock().epoch(&filter.types)
    }

    /// Stores a result computed for `filter`, unless one of its types was
    /// invalidated after `epoch` was read. Returns true if stored.
    pub fn put(&self, key: CacheKey, filter: &QueryFilter, items: Vec<KnowledgeItem>, epoch: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        if state.epoch(&filter.types) != epoch {
            tracing::trace!("stale query result not cached");
            return false;
        }
        state.remove(&key);
        while state.entries.len() >= self.config.capacity {
            let Some((_, oldest)) = state.by_age.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.by_age.insert(generation, key);
        state.entries.insert(
            key,
            Entry {
                types: filter.types.clone(),
                stored_at: now,
                generation,
                items,
            },
        );
        true
    }

    /// Drops entries whose filter can contain any of `types`, including
    /// type-unrestricted filters. Returns how many were dropped.
    pub fn invalidate_types(&self, types: &[KnowledgeType]) -> usize {
        if types.is_empty() {
            return 0;
        }
        let mut state = self.lock();
        for t in types {
            *state.invalidations.entry(*t).or_default() += 1;
        }
        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| e.types.is_empty() || types.iter().any(|t| e.types.contains(t)))
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            state.remove(key);
        }
        stale.len()
    }

    /// Drops everything.
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        state.cleared += 1;
        state.entries.clear();
        state.by_age.clear();
    }

    /// Removes expired entries; returns how many.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, e)| !self.is_live(e, now))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Live entry count (including entries not yet swept).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::time::ManualClock;

    fn cache(capacity: usize) -> (QueryCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CacheConfig {
            capacity,
            ..CacheConfig::default()
        };
        (QueryCache::new(config, clock.clone()), clock)
    }

    #[test]
    fn key_depends_on_worker_and_filter() {
        let f = QueryFilter::new().with_type(KnowledgeType::RiskPattern);
        assert_eq!(cache_key(Some("w1"), &f), cache_key(Some("w1"), &f.clone()));
        assert_ne!(cache_key(Some("w1"), &f), cache_key(Some("w2"), &f));
        assert_ne!(cache_key(Some("w1"), &f), cache_key(Some("w1"), &f.clone().limit(5)));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache(8);
        let f = QueryFilter::new();
        let key = cache_key(None, &f);
        cache.put(key, &f, Vec::new(), 0);

        clock.advance(Duration::from_millis(1999));
        assert!(cache.get(&key).is_some());
        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, entries: 0 });
    }

    #[test]
    fn invalidation_is_type_scoped() {
        let (cache, _) = cache(8);
        let risk = QueryFilter::new().with_type(KnowledgeType::RiskPattern);
        let code = QueryFilter::new().with_type(KnowledgeType::CodePattern);
        let any = QueryFilter::new();
        for f in [&risk, &code, &any] {
            cache.put(cache_key(None, f), f, Vec::new(), cache.epoch(f));
        }

        assert_eq!(cache.invalidate_types(&[KnowledgeType::RiskPattern]), 2);
        assert!(cache.get(&cache_key(None, &code)).is_some());
        assert!(cache.get(&cache_key(None, &risk)).is_none());
        assert!(cache.get(&cache_key(None, &any)).is_none());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let (cache, _) = cache(2);
        let filters: Vec<_> = (1..=3).map(|n| QueryFilter::new().limit(n)).collect();
        for f in &filters {
            cache.put(cache_key(None, f), f, Vec::new(), cache.epoch(f));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&cache_key(None, &filters[0])).is_none());
        assert!(cache.get(&cache_key(None, &filters[2])).is_some());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let (cache, clock) = cache(8);
        let old = QueryFilter::new().limit(1);
        cache.put(cache_key(None, &old), &old, Vec::new(), 0);
        clock.advance(Duration::from_millis(1500));
        let young = QueryFilter::new().limit(2);
        cache.put(cache_key(None, &young), &young, Vec::new(), 0);
        clock.advance(Duration::from_millis(600));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = QueryCache::new(
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
            clock,
        );
        let f = QueryFilter::new();
        assert!(!cache.put(cache_key(None, &f), &f, Vec::new(), 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn results_read_before_an_invalidation_are_not_stored() {
        let (cache, _) = cache(8);
        let risk = QueryFilter::new().with_type(KnowledgeType::RiskPattern);
        let code = QueryFilter::new().with_type(KnowledgeType::CodePattern);
        let any = QueryFilter::new();
        let before: Vec<u64> = [&risk, &code, &any].iter().map(|f| cache.epoch(f)).collect();

        cache.invalidate_types(&[KnowledgeType::RiskPattern]);

        assert!(!cache.put(cache_key(None, &risk), &risk, Vec::new(), before[0]));
        assert!(cache.put(cache_key(None, &code), &code, Vec::new(), before[1]));
        assert!(!cache.put(cache_key(None, &any), &any, Vec::new(), before[2]));
        assert!(cache.put(cache_key(None, &risk), &risk, Vec::new(), cache.epoch(&risk)));

        let stale = cache.epoch(&code);
        cache.invalidate_all();
        assert!(!cache.put(cache_key(Some("w"), &code), &code, Vec::new(), stale));
    }
}
