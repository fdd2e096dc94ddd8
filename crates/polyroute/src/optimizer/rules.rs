//! Optimization rules.
//!
//! An [`OptimizationRule`] pairs a predicate with a pure transform. The
//! transform returns a new descriptor; it never mutates its input. Built-in
//! transforms only inject [`QueryHint`]s or reorder inner joins, so applying
//! a rule never changes the rows a query returns.
//!
//! # Built-in Rules
//!
//! | Rule | Category | Priority | Applies to |
//! |------|----------|----------|------------|
//! | `time_range_pruning` | time-series | critical | time-series reads with a temporal filter |
//! | `bulk_write_batching` | write | high | batch inserts |
//! | `super_table_scan` | time-series | high | time-series reads of a time-series entity |
//! | `tag_filter_pushdown` | time-series | high | time-series reads filtering on tags |
//! | `index_scan` | index | high | relational reads with equality filters |
//! | `join_reordering` | join | medium | relational reads with joins |
//! | `window_partitioning` | aggregation | medium | window functions |
//! | `sorted_group_by` | aggregation | medium | relational group-by |
//! | `sorted_index_scan` | index | low | ordered reads with a limit |
//! | `parallel_scan` | scan | low | unfiltered, unbounded reads |

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::core::BackendKind;
use crate::query::{JoinType, OperationKind, QueryDescriptor, QueryHint};
use crate::routing::analyzer::{self, QueryAnalyzer};

/// Predicate deciding whether a rule applies.
pub type RulePredicate = Arc<dyn Fn(&QueryDescriptor, BackendKind) -> bool + Send + Sync>;

/// Pure transform producing a rewritten descriptor or a failure message.
pub type RuleTransform =
    Arc<dyn Fn(&QueryDescriptor, BackendKind) -> Result<QueryDescriptor, String> + Send + Sync>;

/// Rule priority. Higher tiers run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RulePriority {
    /// Runs last.
    Low,
    /// Default tier.
    Medium,
    /// Runs early.
    High,
    /// Runs first.
    Critical,
}

/// What a rule optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationCategory {
    /// Index selection.
    IndexUsage,
    /// Time-series specific layouts.
    TimeSeries,
    /// Join strategy.
    JoinOptimization,
    /// Grouping and windows.
    Aggregation,
    /// Write batching.
    WriteOptimization,
    /// Scan strategy.
    Scan,
}

/// An optimization rule.
#[derive(Clone)]
pub struct OptimizationRule {
    /// Unique rule name.
    pub name: String,

    /// Category.
    pub category: OptimizationCategory,

    /// Priority tier.
    pub priority: RulePriority,

    /// Estimated improvement in `[0, 1]` when applied.
    pub estimated_improvement: f64,

    /// Human-readable description.
    pub description: String,

    /// Whether the rule participates in optimization.
    pub enabled: bool,

    predicate: RulePredicate,
    transform: RuleTransform,
}

impl OptimizationRule {
    /// Creates an enabled rule.
    pub fn new<P, T>(
        name: impl Into<String>,
        category: OptimizationCategory,
        priority: RulePriority,
        estimated_improvement: f64,
        predicate: P,
        transform: T,
    ) -> Self
    where
        P: Fn(&QueryDescriptor, BackendKind) -> bool + Send + Sync + 'static,
        T: Fn(&QueryDescriptor, BackendKind) -> Result<QueryDescriptor, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            category,
            priority,
            estimated_improvement: estimated_improvement.clamp(0.0, 1.0),
            description: String::new(),
            enabled: true,
            predicate: Arc::new(predicate),
            transform: Arc::new(transform),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Returns true if the rule is enabled and its predicate holds.
    pub fn applies_to(&self, query: &QueryDescriptor, kind: BackendKind) -> bool {
        self.enabled && (self.predicate)(query, kind)
    }

    /// Runs the transform.
    pub fn apply(&self, query: &QueryDescriptor, kind: BackendKind) -> Result<QueryDescriptor, String> {
        (self.transform)(query, kind)
    }
}

impl fmt::Debug for OptimizationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizationRule")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("estimated_improvement", &self.estimated_improvement)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

fn with_hint(query: &QueryDescriptor, hint: QueryHint) -> QueryDescriptor {
    let mut out = query.clone();
    out.push_hint(hint);
    out
}

fn equality_columns(query: &QueryDescriptor) -> Vec<String> {
    query
        .filters
        .iter()
        .filter(|(k, v)| v.op() == crate::query::ComparisonOp::Eq && !analyzer::is_temporal_key(k))
        .map(|(k, _)| k.clone())
        .collect()
}

fn tag_columns(query: &QueryDescriptor) -> Vec<String> {
    query
        .filters
        .keys()
        .filter(|k| analyzer::is_tag_key(k))
        .cloned()
        .collect()
}

/// Counts filters qualified with the joined entity's name.
fn join_selectivity(query: &QueryDescriptor, entity: &str) -> usize {
    let prefix = format!("{}.", entity);
    query.filters.keys().filter(|k| k.starts_with(&prefix)).count()
}

/// Returns the built-in optimization rules.
pub fn default_optimization_rules(analyzer: &QueryAnalyzer) -> Vec<OptimizationRule> {
    let super_table = analyzer.clone();

    vec![
        OptimizationRule::new(
            "time_range_pruning",
            OptimizationCategory::TimeSeries,
            RulePriority::Critical,
            0.3,
            |q, kind| {
                kind == BackendKind::TimeSeries
                    && q.operation == OperationKind::Read
                    && analyzer::has_temporal_filter(q)
            },
            |q, _| {
                let column = q
                    .filters
                    .keys()
                    .find(|k| analyzer::is_temporal_key(k))
                    .cloned()
                    .ok_or_else(|| "no temporal filter".to_string())?;
                Ok(with_hint(q, QueryHint::TimeRangePruning { column }))
            },
        )
        .with_description("prune partitions outside the filtered time range"),
        OptimizationRule::new(
            "bulk_write_batching",
            OptimizationCategory::WriteOptimization,
            RulePriority::High,
            0.25,
            |q, _| q.operation == OperationKind::BatchInsert,
            |q, kind| {
                let batch_size = match kind {
                    BackendKind::TimeSeries => 1000,
                    _ => 500,
                };
                Ok(with_hint(q, QueryHint::BulkWrite { batch_size }))
            },
        )
        .with_description("write rows in engine-sized batches"),
        OptimizationRule::new(
            "super_table_scan",
            OptimizationCategory::TimeSeries,
            RulePriority::High,
            0.2,
            move |q, kind| {
                kind == BackendKind::TimeSeries
                    && q.operation == OperationKind::Read
                    && super_table.is_time_series_entity(&q.entity)
            },
            |q, _| Ok(with_hint(q, QueryHint::SuperTableScan)),
        )
        .with_description("scan through the super table"),
        OptimizationRule::new(
            "tag_filter_pushdown",
            OptimizationCategory::TimeSeries,
            RulePriority::High,
            0.15,
            |q, kind| {
                kind == BackendKind::TimeSeries
                    && q.operation == OperationKind::Read
                    && q.filters.keys().any(|k| analyzer::is_tag_key(k))
            },
            |q, _| Ok(with_hint(q, QueryHint::TagFilter { tags: tag_columns(q) })),
        )
        .with_description("push tag filters into the storage engine"),
        OptimizationRule::new(
            "index_scan",
            OptimizationCategory::IndexUsage,
            RulePriority::High,
            0.2,
            |q, kind| kind == BackendKind::Relational && !equality_columns(q).is_empty(),
            |q, _| {
                Ok(with_hint(
                    q,
                    QueryHint::IndexScan {
                        columns: equality_columns(q),
                    },
                ))
            },
        )
        .with_description("use an index for equality filters"),
        OptimizationRule::new(
            "join_reordering",
            OptimizationCategory::JoinOptimization,
            RulePriority::Medium,
            0.15,
            |q, kind| kind == BackendKind::Relational && q.has_joins(),
            |q, _| {
                let mut out = q.clone();
                let (mut inner, outer): (Vec<_>, Vec<_>) = out
                    .joins
                    .drain(..)
                    .partition(|j| j.join_type == JoinType::Inner);
                inner.sort_by(|a, b| {
                    join_selectivity(q, &b.entity).cmp(&join_selectivity(q, &a.entity))
                });
                out.joins = inner.into_iter().chain(outer).collect();
                let entities = out.joins.iter().map(|j| j.entity.clone()).collect();
                out.push_hint(QueryHint::JoinOrder { entities });
                Ok(out)
            },
        )
        .with_description("evaluate the most selective inner joins first"),
        OptimizationRule::new(
            "window_partitioning",
            OptimizationCategory::Aggregation,
            RulePriority::Medium,
            0.1,
            |q, _| !q.windows.is_empty(),
            |q, _| {
                let partition_by = q
                    .windows
                    .first()
                    .map(|w| w.partition_by.clone())
                    .unwrap_or_default();
                Ok(with_hint(q, QueryHint::WindowPartitioning { partition_by }))
            },
        )
        .with_description("share one sort across windows with the same partitioning"),
        OptimizationRule::new(
            "sorted_group_by",
            OptimizationCategory::Aggregation,
            RulePriority::Medium,
            0.1,
            |q, kind| kind == BackendKind::Relational && !q.group_by.is_empty(),
            |q, _| {
                Ok(with_hint(
                    q,
                    QueryHint::SortedIndexScan {
                        columns: q.group_by.clone(),
                    },
                ))
            },
        )
        .with_description("stream groups from an index ordered by the grouping keys"),
        OptimizationRule::new(
            "sorted_index_scan",
            OptimizationCategory::IndexUsage,
            RulePriority::Low,
            0.05,
            |q, _| q.operation == OperationKind::Read && !q.order_by.is_empty() && q.limit.is_some(),
            |q, _| {
                Ok(with_hint(
                    q,
                    QueryHint::SortedIndexScan {
                        columns: q.order_by.iter().map(|o| o.column.clone()).collect(),
                    },
                ))
            },
        )
        .with_description("read the first rows in index order instead of sorting"),
        OptimizationRule::new(
            "parallel_scan",
            OptimizationCategory::Scan,
            RulePriority::Low,
            0.05,
            |q, _| q.operation == OperationKind::Read && q.filters.is_empty() && q.limit.is_none(),
            |q, _| Ok(with_hint(q, QueryHint::ParallelScan)),
        )
        .with_description("scan partitions in parallel"),
    ]
}
