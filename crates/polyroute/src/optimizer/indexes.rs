//! Index recommendations.
//!
//! Relational engines get B-tree and composite recommendations for equality
//! filters, range filters, join keys and sort columns. Time-series engines
//! can only index their timestamp and tag columns, so every recommendation
//! for them is either a timestamp or a tag index.

use serde::Serialize;

use crate::core::BackendKind;
use crate::query::{ComparisonOp, QueryDescriptor};
use crate::routing::analyzer;

use super::{BoundedCache, DEFAULT_CACHE_CAPACITY, shape_key};

/// Index structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Single-column B-tree.
    BTree,
    /// Multi-column B-tree.
    Composite,
    /// Primary timestamp index of a time-series table.
    Timestamp,
    /// Tag index of a time-series super table.
    Tag,
}

/// A recommended index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRecommendation {
    /// Entity to index.
    pub entity: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Index structure.
    pub kind: IndexKind,
    /// Kind the recommendation targets.
    pub backend_kind: BackendKind,
    /// Why the index helps.
    pub reason: String,
    /// Estimated benefit in `[0, 1]`.
    pub estimated_benefit: f64,
}

impl IndexRecommendation {
    fn new(
        entity: impl Into<String>,
        columns: Vec<String>,
        kind: IndexKind,
        backend_kind: BackendKind,
        reason: impl Into<String>,
        estimated_benefit: f64,
    ) -> Self {
        Self {
            entity: entity.into(),
            columns,
            kind,
            backend_kind,
            reason: reason.into(),
            estimated_benefit,
        }
    }

    /// Returns true if this recommendation indexes `column` first.
    pub fn leads_with(&self, column: &str) -> bool {
        self.columns.first().is_some_and(|c| c == column)
    }
}

/// Produces and caches index recommendations.
#[derive(Debug)]
pub struct IndexAdvisor {
    cache: BoundedCache<String, Vec<IndexRecommendation>>,
}

impl Default for IndexAdvisor {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl IndexAdvisor {
    /// Creates an advisor with a bounded cache.
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: BoundedCache::new(cache_capacity),
        }
    }

    /// Recommends indexes for a descriptor on a backend kind.
    pub fn recommend(&self, query: &QueryDescriptor, kind: BackendKind) -> Vec<IndexRecommendation> {
        let key = shape_key(query, kind);
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let recommendations = match kind {
            BackendKind::TimeSeries => time_series_recommendations(query),
            BackendKind::Relational => relational_recommendations(query),
            BackendKind::Custom(_) => generic_recommendations(query, kind),
        };

        self.cache.insert(key, recommendations.clone());
        recommendations
    }

    /// Number of cached entries.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

fn push_unique(out: &mut Vec<IndexRecommendation>, rec: IndexRecommendation) {
    let covered = out
        .iter()
        .any(|r| r.entity == rec.entity && r.columns.starts_with(&rec.columns));
    if !covered {
        out.push(rec);
    }
}

/// Strips an `entity.` qualifier when it names the base entity.
fn local_column<'a>(query: &QueryDescriptor, column: &'a str) -> Option<&'a str> {
    match column.split_once('.') {
        Some((entity, col)) if entity == query.entity => Some(col),
        Some(_) => None,
        None => Some(column),
    }
}

fn relational_recommendations(query: &QueryDescriptor) -> Vec<IndexRecommendation> {
    let kind = BackendKind::Relational;
    let mut out = Vec::new();

    let equality: Vec<String> = query
        .filters
        .iter()
        .filter(|(_, v)| v.op() == ComparisonOp::Eq || v.op() == ComparisonOp::In)
        .filter_map(|(k, _)| local_column(query, k).map(str::to_string))
        .collect();
    let ranges: Vec<String> = query
        .filters
        .iter()
        .filter(|(_, v)| v.op().is_range())
        .filter_map(|(k, _)| local_column(query, k).map(str::to_string))
        .collect();

    match equality.len() {
        0 => {}
        1 => push_unique(
            &mut out,
            IndexRecommendation::new(
                &query.entity,
                equality.clone(),
                IndexKind::BTree,
                kind,
                "equality filter",
                0.3,
            ),
        ),
        _ => {
            let mut columns = equality.clone();
            columns.extend(ranges.iter().take(1).cloned());
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    columns,
                    IndexKind::Composite,
                    kind,
                    "equality filters, range column last",
                    0.35,
                ),
            );
        }
    }

    for column in &ranges {
        push_unique(
            &mut out,
            IndexRecommendation::new(
                &query.entity,
                vec![column.clone()],
                IndexKind::BTree,
                kind,
                if analyzer::is_temporal_key(column) {
                    "time range filter"
                } else {
                    "range filter"
                },
                0.25,
            ),
        );
    }

    for join in &query.joins {
        for (entity, column) in join.key_columns(&query.entity) {
            if column == "id" {
                continue;
            }
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    entity,
                    vec![column],
                    IndexKind::BTree,
                    kind,
                    format!("join key for {}", join.entity),
                    0.4,
                ),
            );
        }
    }

    if query.limit.is_some() {
        let columns: Vec<String> = query
            .order_by
            .iter()
            .filter_map(|o| local_column(query, &o.column).map(str::to_string))
            .collect();
        if !columns.is_empty() {
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    columns,
                    IndexKind::BTree,
                    kind,
                    "ordered reads with a limit",
                    0.15,
                ),
            );
        }
    }

    out
}

fn time_series_recommendations(query: &QueryDescriptor) -> Vec<IndexRecommendation> {
    let kind = BackendKind::TimeSeries;
    let mut out = Vec::new();

    for key in query.filters.keys() {
        if analyzer::is_temporal_key(key) {
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    vec![key.clone()],
                    IndexKind::Timestamp,
                    kind,
                    "keep the timestamp as the first column to enable partition pruning",
                    0.4,
                ),
            );
        } else if analyzer::is_tag_key(key) {
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    vec![key.clone()],
                    IndexKind::Tag,
                    kind,
                    "tag filter",
                    0.3,
                ),
            );
        } else {
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    vec![key.clone()],
                    IndexKind::Tag,
                    kind,
                    "only tag columns can be indexed; declare this column as a tag",
                    0.1,
                ),
            );
        }
    }

    out
}

fn generic_recommendations(query: &QueryDescriptor, kind: BackendKind) -> Vec<IndexRecommendation> {
    let mut out = Vec::new();
    for (key, value) in &query.filters {
        if value.op() == ComparisonOp::Eq {
            push_unique(
                &mut out,
                IndexRecommendation::new(
                    &query.entity,
                    vec![key.clone()],
                    IndexKind::BTree,
                    kind,
                    "equality filter",
                    0.2,
                ),
            );
        }
    }
    out
}
