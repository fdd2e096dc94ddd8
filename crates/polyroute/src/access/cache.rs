//! Result cache.
//!
//! Bounded, TTL-limited map from [`CacheKey`] to [`QueryResult`]. When an
//! insert overflows the capacity the oldest half of the entries is evicted.
//! Entries remember every entity their descriptor touched so a write to any
//! of them invalidates the entry.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::query::{CacheKey, QueryDescriptor, QueryResult};

#[derive(Debug, Clone)]
struct CacheEntry {
    result: QueryResult,
    entities: Vec<String>,
    inserted_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Entries dropped by overflow eviction.
    pub evictions: u64,
    /// Entries dropped by writes.
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    evictions: u64,
    invalidations: u64,
}

/// Cache of read results.
#[derive(Debug)]
pub struct ResultCache {
    max_entries: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

fn normalize(entity: &str) -> String {
    entity.trim().to_lowercase()
}

impl ResultCache {
    /// Creates a cache.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Returns a fresh entry. Stale entries are removed and count as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<QueryResult> {
        let mut state = self.state.lock();
        let entry = state.entries.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            state.entries.remove(key);
            trace!(key = %key, "cache entry expired");
            return None;
        }
        Some(entry.result.clone())
    }

    /// Stores a result for a descriptor.
    pub fn insert(&self, key: CacheKey, query: &QueryDescriptor, result: QueryResult) {
        let entities = query.touched_entities().iter().map(|e| normalize(e)).collect();
        let mut state = self.state.lock();
        state.entries.insert(
            key,
            CacheEntry {
                result,
                entities,
                inserted_at: Instant::now(),
            },
        );

        if state.entries.len() > self.max_entries {
            let mut by_age: Vec<(CacheKey, Instant)> = state
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.inserted_at))
                .collect();
            by_age.sort_by_key(|(_, inserted_at)| *inserted_at);

            let evict = (by_age.len() / 2).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                state.entries.remove(&key);
            }
            state.evictions += evict as u64;
            trace!(evicted = evict, "cache overflow");
        }
    }

    /// Drops every entry touching `entity`. Returns the number dropped.
    pub fn invalidate_entity(&self, entity: &str) -> usize {
        let entity = normalize(entity);
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.entities.contains(&entity));
        let dropped = before - state.entries.len();
        state.invalidations += dropped as u64;
        dropped
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of entries, including stale ones not yet removed.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            evictions: state.evictions,
            invalidations: state.invalidations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterValue, JoinClause};
    use serde_json::json;

    fn cached(cache: &ResultCache, query: &QueryDescriptor) {
        cache.insert(
            query.cache_key(),
            query,
            QueryResult::from_rows(vec![json!({"id": 1})]),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        let query = QueryDescriptor::read("orders");
        cached(&cache, &query);

        assert!(cache.get(&query.cache_key()).is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&query.cache_key()).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_half() {
        let cache = ResultCache::new(4, Duration::from_secs(60));
        let queries: Vec<QueryDescriptor> = (0..5)
            .map(|i| QueryDescriptor::read("orders").with_filter("id", FilterValue::eq(i)))
            .collect();

        for query in &queries {
            cached(&cache, query);
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.get(&queries[0].cache_key()).is_none());
        assert!(cache.get(&queries[1].cache_key()).is_none());
        assert!(cache.get(&queries[4].cache_key()).is_some());
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_invalidate_entity_covers_joins() {
        let cache = ResultCache::new(10, Duration::from_secs(60));
        let orders = QueryDescriptor::read("orders");
        let joined = QueryDescriptor::read("invoices").with_join(JoinClause::inner("Orders"));
        let users = QueryDescriptor::read("users");
        cached(&cache, &orders);
        cached(&cache, &joined);
        cached(&cache, &users);

        assert_eq!(cache.invalidate_entity("orders"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&users.cache_key()).is_some());
        assert_eq!(cache.stats().invalidations, 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
