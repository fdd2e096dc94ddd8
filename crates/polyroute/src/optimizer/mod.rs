//! Query optimization.
//!
//! The optimizer rewrites a [`QueryDescriptor`](crate::query::QueryDescriptor)
//! for a target backend kind by folding prioritized rules over it, and
//! produces execution-plan estimates and index recommendations.
//!
//! - [`rules`] - optimization rules and the built-in rule set
//! - [`cost`] - cost model and execution-plan estimates
//! - [`indexes`] - index recommendations per backend kind
//! - [`engine`] - the [`QueryOptimizer`] pipeline, caches and statistics

pub mod cost;
pub mod engine;
pub mod indexes;
pub mod rules;

pub use cost::{CostBreakdown, CostConfig, CostModel, EstimatedCount, ExecutionPlan, PlanStep};
pub use engine::{OptimizationResult, OptimizationStatistics, QueryOptimizer};
pub use indexes::{IndexAdvisor, IndexKind, IndexRecommendation};
pub use rules::{OptimizationCategory, OptimizationRule, RulePriority, default_optimization_rules};

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

use crate::core::BackendKind;
use crate::query::QueryDescriptor;

/// Default capacity of the plan and index caches.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Insertion-ordered cache that evicts its oldest entry when full.
#[derive(Debug)]
pub(crate) struct BoundedCache<K, V> {
    capacity: usize,
    inner: Mutex<(HashMap<K, V>, VecDeque<K>)>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().0.get(key).cloned()
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock();
        let (map, order) = &mut *guard;
        if map.insert(key.clone(), value).is_none() {
            order.push_back(key);
        }
        while map.len() > self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    map.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().0.len()
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.0.clear();
        guard.1.clear();
    }
}

/// Cache key combining backend kind, entity and a normalized query shape.
pub(crate) fn shape_key(query: &QueryDescriptor, kind: BackendKind) -> String {
    let filters: Vec<String> = query
        .filters
        .iter()
        .map(|(k, v)| format!("{}:{:?}", k, v.op()))
        .collect();
    let joins: Vec<String> = query
        .joins
        .iter()
        .flat_map(|j| j.key_columns(&query.entity))
        .map(|(e, c)| format!("{}.{}", e, c))
        .collect();
    let order: Vec<&str> = query.order_by.iter().map(|o| o.column.as_str()).collect();

    format!(
        "{}|{}|{}|f[{}]|j[{}]|g[{}]|o[{}]|w{}|l{}|h{}",
        kind,
        query.entity.trim().to_lowercase(),
        query.operation,
        filters.join(","),
        joins.join(","),
        query.group_by.join(","),
        order.join(","),
        query.windows.len(),
        query.limit.is_some(),
        query.hints.len(),
    )
}

/// Cache key for execution plans: the query shape plus every field the cost
/// model reads, so descriptors that differ only in paging, payload size, hints
/// or recorded improvement never share a plan.
pub(crate) fn plan_key(query: &QueryDescriptor, kind: BackendKind) -> String {
    let having: Vec<&str> = query.having.keys().map(String::as_str).collect();
    let features: Vec<&str> = query.required_features.iter().map(String::as_str).collect();

    format!(
        "{}|e{}|l{:?}|s{:?}|p{}|j{:?}|w{:?}|hv[{}]|rf[{}]|h{:?}|i{:x}",
        shape_key(query, kind),
        query.entity,
        query.limit,
        query.offset,
        query.payload.len(),
        query.joins,
        query.windows,
        having.join(","),
        features.join(","),
        query.hints,
        query.lineage_improvement().to_bits(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterValue;

    #[test]
    fn test_bounded_cache_evicts_oldest() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.get(&"c"), Some(3));

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_bounded_cache_overwrite_keeps_order() {
        let cache = BoundedCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 10);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_shape_key_ignores_filter_values() {
        let a = QueryDescriptor::read("tick_data").with_filter("symbol", FilterValue::eq("AAPL"));
        let b = QueryDescriptor::read("tick_data").with_filter("symbol", FilterValue::eq("MSFT"));
        assert_eq!(
            shape_key(&a, BackendKind::TimeSeries),
            shape_key(&b, BackendKind::TimeSeries)
        );
        assert_ne!(
            shape_key(&a, BackendKind::TimeSeries),
            shape_key(&a, BackendKind::Relational)
        );
    }

    #[test]
    fn test_plan_key_tracks_paging_and_payload() {
        let base = QueryDescriptor::read("orders").with_limit(10);
        let kind = BackendKind::Relational;
        assert_ne!(
            plan_key(&base, kind),
            plan_key(&base.clone().with_limit(5000), kind)
        );
        assert_ne!(
            plan_key(&base, kind),
            plan_key(&base.clone().with_offset(20), kind)
        );

        let one = QueryDescriptor::insert("orders", vec![serde_json::json!({"id": 1})]);
        let two = QueryDescriptor::insert(
            "orders",
            vec![serde_json::json!({"id": 1}), serde_json::json!({"id": 2})],
        );
        assert_ne!(plan_key(&one, kind), plan_key(&two, kind));
    }
}
