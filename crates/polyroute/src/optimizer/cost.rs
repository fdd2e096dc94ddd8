//! Cost estimation and execution-plan analysis.
//!
//! # Cost Model
//!
//! `cost = operation weight × estimated rows × join multiplier × backend multiplier × (1 - recorded improvement)`
//!
//! - **Operation weight**: per [`OperationKind`], writes cost more than reads
//! - **Estimated rows**: a default table size halved for every filter,
//!   capped by the limit; writes use the payload size
//! - **Join multiplier**: grows linearly with the number of joins
//! - **Backend multiplier**: how well the kind suits the query's shape
//! - **Recorded improvement**: the optimization lineage total, capped at 0.9
//!
//! Units are arbitrary. Only comparisons between estimates are meaningful.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::BackendKind;
use crate::query::{OperationKind, QueryDescriptor, QueryHint};
use crate::routing::analyzer::{QueryAnalyzer, QueryComplexity, QueryFeature};

/// Estimated result count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EstimatedCount {
    /// Exact count known.
    Exact(u64),
    /// Approximate count.
    Approximate(u64),
    /// Unknown count.
    Unknown,
}

impl EstimatedCount {
    /// Returns the expected value.
    pub fn expected(&self) -> u64 {
        match self {
            EstimatedCount::Exact(n) => *n,
            EstimatedCount::Approximate(n) => *n,
            EstimatedCount::Unknown => 100,
        }
    }
}

/// Cost model configuration.
#[derive(Debug, Clone)]
pub struct CostConfig {
    /// Rows assumed for an unfiltered entity.
    pub default_rows: u64,

    /// Weight per operation kind.
    pub operation_weights: HashMap<OperationKind, f64>,

    /// Added to the join multiplier per join.
    pub join_factor: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        let operation_weights = HashMap::from([
            (OperationKind::Read, 1.0),
            (OperationKind::Insert, 1.2),
            (OperationKind::BatchInsert, 0.8),
            (OperationKind::Update, 1.5),
            (OperationKind::BatchUpdate, 1.3),
            (OperationKind::Upsert, 1.6),
            (OperationKind::Delete, 1.3),
        ]);

        Self {
            default_rows: 10_000,
            operation_weights,
            join_factor: 0.75,
        }
    }
}

/// Breakdown of cost components.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostBreakdown {
    /// Operation weight.
    pub operation_weight: f64,
    /// Expected rows touched.
    pub rows: u64,
    /// Join multiplier.
    pub join_multiplier: f64,
    /// Backend suitability multiplier.
    pub backend_multiplier: f64,
    /// Fraction removed by recorded optimizations.
    pub optimization_discount: f64,
}

impl CostBreakdown {
    /// Returns the total cost.
    pub fn total(&self) -> f64 {
        self.operation_weight
            * self.rows as f64
            * self.join_multiplier
            * self.backend_multiplier
            * (1.0 - self.optimization_discount)
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Step name, e.g. `index_scan` or `hash_join`.
    pub operation: String,
    /// Step detail.
    pub detail: String,
}

impl PlanStep {
    fn new(operation: &str, detail: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }
}

/// Execution-plan estimate for a descriptor on one backend kind.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Target kind.
    pub backend_kind: BackendKind,
    /// Complexity class.
    pub complexity: QueryComplexity,
    /// Complexity score (1-10).
    pub complexity_score: u8,
    /// Expected rows.
    pub estimated_rows: EstimatedCount,
    /// Total estimated cost.
    pub estimated_cost: f64,
    /// Cost components.
    pub breakdown: CostBreakdown,
    /// Ordered plan steps.
    pub steps: Vec<PlanStep>,
    /// Planner hints carried by the descriptor.
    pub hints: Vec<QueryHint>,
    /// Plan-level warnings, e.g. joins on an engine without join support.
    pub warnings: Vec<String>,
}

/// Cost model for descriptors.
#[derive(Debug, Clone)]
pub struct CostModel {
    config: CostConfig,
    analyzer: QueryAnalyzer,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::new(CostConfig::default(), QueryAnalyzer::new())
    }
}

impl CostModel {
    /// Creates a cost model.
    pub fn new(config: CostConfig, analyzer: QueryAnalyzer) -> Self {
        Self { config, analyzer }
    }

    /// Estimates the rows a descriptor touches.
    pub fn estimate_rows(&self, query: &QueryDescriptor) -> EstimatedCount {
        if query.operation.is_append() {
            return EstimatedCount::Exact(query.payload.len().max(1) as u64);
        }

        let halvings = u32::try_from(query.filters.len()).unwrap_or(u32::MAX).min(63);
        let mut rows = (self.config.default_rows >> halvings).max(1);
        if let Some(limit) = query.limit {
            rows = rows.min(limit.max(1));
        }
        EstimatedCount::Approximate(rows)
    }

    /// Estimates the cost of a descriptor on a backend kind.
    pub fn estimate_cost(&self, query: &QueryDescriptor, kind: BackendKind) -> CostBreakdown {
        let analysis = self.analyzer.analyze(query);

        let operation_weight = self
            .config
            .operation_weights
            .get(&query.operation)
            .copied()
            .unwrap_or(1.0);

        let join_multiplier = 1.0 + self.config.join_factor * query.joins.len() as f64;

        let ts_like = analysis.is_time_series_like();
        let backend_multiplier = match kind {
            BackendKind::TimeSeries => {
                if analysis.has(QueryFeature::Join) {
                    4.0
                } else if analysis.has(QueryFeature::Mutation) {
                    2.0
                } else if ts_like {
                    0.5
                } else {
                    1.2
                }
            }
            BackendKind::Relational => {
                if ts_like && analysis.has(QueryFeature::AppendWrite) {
                    1.5
                } else if ts_like {
                    1.2
                } else {
                    1.0
                }
            }
            BackendKind::Custom(_) => 1.0,
        };

        CostBreakdown {
            operation_weight,
            rows: self.estimate_rows(query).expected(),
            join_multiplier,
            backend_multiplier,
            optimization_discount: query.lineage_improvement().clamp(0.0, 0.9),
        }
    }

    /// Builds an execution-plan estimate.
    pub fn plan(&self, query: &QueryDescriptor, kind: BackendKind) -> ExecutionPlan {
        let analysis = self.analyzer.analyze(query);
        let breakdown = self.estimate_cost(query, kind);
        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        if query.operation.is_write() {
            let detail = match query.hints.iter().find_map(|h| match h {
                QueryHint::BulkWrite { batch_size } => Some(*batch_size),
                _ => None,
            }) {
                Some(batch) => format!("{} {} in batches of {}", query.operation, query.entity, batch),
                None => format!("{} {}", query.operation, query.entity),
            };
            steps.push(PlanStep::new("write", detail));
        } else {
            steps.push(scan_step(query));
        }

        if !query.filters.is_empty() {
            let columns: Vec<&str> = query.filters.keys().map(String::as_str).collect();
            steps.push(PlanStep::new("filter", columns.join(", ")));
        }

        for join in &query.joins {
            steps.push(PlanStep::new(
                "hash_join",
                format!("{:?} join {}", join.join_type, join.entity).to_lowercase(),
            ));
        }
        if !query.joins.is_empty() && kind == BackendKind::TimeSeries {
            warnings.push("time-series engines do not support cross-entity joins".to_string());
        }

        if !query.group_by.is_empty() {
            steps.push(PlanStep::new("aggregate", query.group_by.join(", ")));
        }
        for window in &query.windows {
            steps.push(PlanStep::new(
                "window",
                format!("{} over ({})", window.function, window.partition_by.join(", ")),
            ));
        }
        if !query.order_by.is_empty() {
            let sorted_by_index = query
                .hints
                .iter()
                .any(|h| matches!(h, QueryHint::SortedIndexScan { .. }));
            let columns: Vec<&str> = query.order_by.iter().map(|o| o.column.as_str()).collect();
            steps.push(PlanStep::new(
                if sorted_by_index { "index_order" } else { "sort" },
                columns.join(", "),
            ));
        }
        if let Some(limit) = query.limit {
            steps.push(PlanStep::new("limit", limit.to_string()));
        }

        if query.operation.is_mutation() && kind == BackendKind::TimeSeries {
            warnings.push("time-series engines have limited support for updating rows".to_string());
        }

        ExecutionPlan {
            backend_kind: kind,
            complexity: analysis.complexity,
            complexity_score: analysis.complexity_score,
            estimated_rows: self.estimate_rows(query),
            estimated_cost: breakdown.total(),
            breakdown,
            steps,
            hints: query.hints.clone(),
            warnings,
        }
    }
}

fn scan_step(query: &QueryDescriptor) -> PlanStep {
    for hint in &query.hints {
        match hint {
            QueryHint::SuperTableScan => {
                return PlanStep::new("super_table_scan", query.entity.clone());
            }
            QueryHint::IndexScan { columns } => {
                return PlanStep::new(
                    "index_scan",
                    format!("{} on ({})", query.entity, columns.join(", ")),
                );
            }
            _ => {}
        }
    }
    let parallel = query.has_hint(&QueryHint::ParallelScan);
    PlanStep::new(
        if parallel { "parallel_scan" } else { "full_scan" },
        query.entity.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AppliedOptimization, FilterValue, JoinClause};

    #[test]
    fn test_rows_halve_per_filter() {
        let model = CostModel::default();
        let none = QueryDescriptor::read("orders");
        let two = none
            .clone()
            .with_filter("a", FilterValue::eq(1))
            .with_filter("b", FilterValue::eq(2));

        assert_eq!(model.estimate_rows(&none).expected(), 10_000);
        assert_eq!(model.estimate_rows(&two).expected(), 2_500);
        assert_eq!(
            model.estimate_rows(&none.clone().with_limit(10)).expected(),
            10
        );
    }

    #[test]
    fn test_insert_rows_are_exact() {
        let model = CostModel::default();
        let insert = QueryDescriptor::insert(
            "tick_data",
            vec![serde_json::json!({}), serde_json::json!({}), serde_json::json!({})],
        );
        assert_eq!(model.estimate_rows(&insert), EstimatedCount::Exact(3));
    }

    #[test]
    fn test_time_series_query_cheaper_on_time_series() {
        let model = CostModel::default();
        let query = QueryDescriptor::read("tick_data")
            .with_filter("min_timestamp", FilterValue::gte("2024-01-01"));

        let ts = model.estimate_cost(&query, BackendKind::TimeSeries).total();
        let rel = model.estimate_cost(&query, BackendKind::Relational).total();
        assert!(ts < rel);
    }

    #[test]
    fn test_joins_expensive_on_time_series() {
        let model = CostModel::default();
        let query = QueryDescriptor::read("orders").with_join(JoinClause::inner("users"));

        let ts = model.plan(&query, BackendKind::TimeSeries);
        let rel = model.plan(&query, BackendKind::Relational);
        assert!(ts.estimated_cost > rel.estimated_cost);
        assert!(!ts.warnings.is_empty());
        assert!(rel.warnings.is_empty());
    }

    #[test]
    fn test_lineage_discounts_cost() {
        let model = CostModel::default();
        let base = QueryDescriptor::read("orders");
        let mut optimized = base.clone();
        optimized.lineage.push(AppliedOptimization {
            rule: "parallel_scan".to_string(),
            improvement: 0.5,
        });

        let a = model.estimate_cost(&base, BackendKind::Relational).total();
        let b = model.estimate_cost(&optimized, BackendKind::Relational).total();
        assert!((b - a * 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_plan_steps() {
        let model = CostModel::default();
        let mut query = QueryDescriptor::read("orders")
            .with_join(JoinClause::inner("users"))
            .with_group_by(["users.id"])
            .with_order_by("total", crate::query::SortDirection::Desc)
            .with_limit(5);
        query.push_hint(QueryHint::IndexScan {
            columns: vec!["status".to_string()],
        });

        let plan = model.plan(&query, BackendKind::Relational);
        let ops: Vec<&str> = plan.steps.iter().map(|s| s.operation.as_str()).collect();
        assert_eq!(ops, vec!["index_scan", "hash_join", "aggregate", "sort", "limit"]);
        assert_eq!(plan.complexity, QueryComplexity::Complex);
        assert_eq!(plan.steps[1].detail, "inner join users");
    }
}
