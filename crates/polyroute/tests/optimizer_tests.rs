//! Integration tests for the query optimizer.
//!
//! Covers the rule pipeline contract (priority order, lineage, failure
//! isolation), complexity classification and index recommendations.

use polyroute::core::BackendKind;
use polyroute::optimizer::{
    EstimatedCount, IndexKind, OptimizationCategory, OptimizationRule, QueryOptimizer, RulePriority,
};
use polyroute::query::{FilterValue, JoinClause, QueryDescriptor, QueryHint, SortDirection};
use polyroute::routing::QueryComplexity;

fn orders_by_user() -> QueryDescriptor {
    QueryDescriptor::read("orders")
        .with_join(JoinClause::inner("users"))
        .with_group_by(["users.id"])
}

fn tick_query() -> QueryDescriptor {
    QueryDescriptor::read("tick_data")
        .with_filter("symbol", FilterValue::eq("AAPL"))
        .with_filter("min_timestamp", FilterValue::gte("2024-01-01T00:00:00Z"))
}

// ============================================================================
// Complexity and Index Advice
// ============================================================================

/// Test the join plus group-by scenario is complex and gets a join-key index.
#[test]
fn test_join_group_by_is_complex_with_join_key_index() {
    let optimizer = QueryOptimizer::new();
    let result = optimizer.optimize(&orders_by_user(), BackendKind::Relational);

    assert_eq!(result.complexity, QueryComplexity::Complex);
    assert!(
        result
            .index_recommendations
            .iter()
            .any(|r| r.entity == "orders" && r.leads_with("user_id"))
    );
}

/// Test time-series recommendations are limited to timestamp and tag indexes.
#[test]
fn test_time_series_indexes() {
    let optimizer = QueryOptimizer::new();
    let recs = optimizer.suggest_indexes(&tick_query(), BackendKind::TimeSeries);

    assert!(!recs.is_empty());
    assert!(
        recs.iter()
            .all(|r| matches!(r.kind, IndexKind::Timestamp | IndexKind::Tag))
    );
}

/// Test the execution plan reflects the target kind and a positive cost.
#[test]
fn test_execution_plan_estimate() {
    let optimizer = QueryOptimizer::new();
    let query = orders_by_user()
        .with_order_by("users.id", SortDirection::Asc)
        .with_limit(10);

    let plan = optimizer.analyze_execution_plan(&query, BackendKind::Relational);
    assert_eq!(plan.backend_kind, BackendKind::Relational);
    assert_eq!(plan.complexity, QueryComplexity::Complex);
    assert!(optimizer.estimate_cost(&query, BackendKind::Relational) > 0.0);
}

/// Test plans for descriptors differing only in paging are not shared.
#[test]
fn test_execution_plan_tracks_limit_and_offset() {
    let optimizer = QueryOptimizer::new();
    let kind = BackendKind::Relational;

    let small = optimizer.analyze_execution_plan(&QueryDescriptor::read("orders").with_limit(10), kind);
    let large =
        optimizer.analyze_execution_plan(&QueryDescriptor::read("orders").with_limit(5000), kind);
    let paged = optimizer.analyze_execution_plan(
        &QueryDescriptor::read("orders").with_limit(5000).with_offset(100),
        kind,
    );

    assert_eq!(small.estimated_rows, EstimatedCount::Approximate(10));
    assert_eq!(large.estimated_rows, EstimatedCount::Approximate(5000));
    assert!(large.steps.iter().any(|s| s.detail == "5000"));
    assert_eq!(paged.estimated_rows, EstimatedCount::Approximate(5000));
}

// ============================================================================
// Pipeline Contract
// ============================================================================

/// Test re-optimization never lowers the improvement or re-applies rules.
#[test]
fn test_reoptimization_is_monotonic() {
    let optimizer = QueryOptimizer::new();
    let first = optimizer.optimize(&tick_query(), BackendKind::TimeSeries);
    let second = optimizer.optimize(&first.optimized, BackendKind::TimeSeries);

    assert!(first.changed());
    assert!(second.estimated_improvement >= first.estimated_improvement);
    assert!(second.applied_rules.is_empty());
    assert_eq!(second.optimized.lineage, first.optimized.lineage);
}

/// Test a CRITICAL rule's effect survives a LOW no-op rule.
#[test]
fn test_critical_rule_effect_survives_low_rule() {
    let optimizer = QueryOptimizer::new();
    optimizer.add_rule(OptimizationRule::new(
        "force_parallel_scan",
        OptimizationCategory::Scan,
        RulePriority::Critical,
        0.1,
        |q, _| q.entity == "customers",
        |q, _| {
            let mut out = q.clone();
            out.push_hint(QueryHint::ParallelScan);
            Ok(out)
        },
    ));
    optimizer.add_rule(OptimizationRule::new(
        "noop",
        OptimizationCategory::Scan,
        RulePriority::Low,
        0.05,
        |q, _| q.entity == "customers",
        |q, _| Ok(q.clone()),
    ));

    let query = QueryDescriptor::read("customers").with_limit(10);
    let result = optimizer.optimize(&query, BackendKind::Relational);

    assert_eq!(result.applied_rules, vec!["force_parallel_scan", "noop"]);
    assert!(result.optimized.has_hint(&QueryHint::ParallelScan));
}

/// Test a failing rule degrades to a warning and the pipeline continues.
#[test]
fn test_failing_rule_is_isolated() {
    let optimizer = QueryOptimizer::new();
    optimizer.add_rule(OptimizationRule::new(
        "broken",
        OptimizationCategory::IndexUsage,
        RulePriority::Critical,
        0.3,
        |_, _| true,
        |_, _| Err("cannot rewrite".to_string()),
    ));

    let result = optimizer.optimize(&tick_query(), BackendKind::TimeSeries);
    assert!(result.warnings.iter().any(|w| w.contains("broken")));
    assert!(result.optimized.has_hint(&QueryHint::SuperTableScan));
}

/// Test the aggregate improvement never exceeds the cap.
#[test]
fn test_improvement_bounded() {
    let optimizer = QueryOptimizer::new();
    for i in 0..4 {
        optimizer.add_rule(OptimizationRule::new(
            format!("eager_{}", i),
            OptimizationCategory::Scan,
            RulePriority::Medium,
            0.4,
            |_, _| true,
            |q, _| Ok(q.clone()),
        ));
    }

    let result = optimizer.optimize(&tick_query(), BackendKind::TimeSeries);
    assert!(result.estimated_improvement <= 0.9);
}

// ============================================================================
// Statistics
// ============================================================================

/// Test statistics track optimizations and rule usage.
#[test]
fn test_statistics_track_usage() {
    let optimizer = QueryOptimizer::new();
    optimizer.optimize(&tick_query(), BackendKind::TimeSeries);
    optimizer.optimize(&tick_query(), BackendKind::TimeSeries);

    let stats = optimizer.statistics();
    assert_eq!(stats.total_optimizations, 2);
    assert_eq!(stats.rule_usage.get("super_table_scan"), Some(&2));
    assert!(stats.most_applied_rules.len() <= 5);
}
