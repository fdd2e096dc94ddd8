//! Integration tests for query routing.
//!
//! These tests drive the router through the public API with in-memory
//! executors registered for both built-in kinds.

use std::sync::Arc;

use polyroute::backends::MemoryExecutor;
use polyroute::core::{BackendExecutor, BackendKind, CapabilityRegistry};
use polyroute::query::{FilterValue, JoinClause, QueryDescriptor};
use polyroute::routing::{QueryRouter, RoutingError, RoutingRule, SelectionPolicy};

fn router(executors: &[(&str, BackendKind)]) -> (QueryRouter, Vec<Arc<MemoryExecutor>>) {
    let router = QueryRouter::new(Arc::new(CapabilityRegistry::new()));
    let mut registered = Vec::new();
    for (id, kind) in executors {
        let executor = Arc::new(MemoryExecutor::new(*id, *kind));
        router.register(executor.clone());
        registered.push(executor);
    }
    (router, registered)
}

fn standard() -> QueryRouter {
    router(&[
        ("pg-1", BackendKind::Relational),
        ("ts-1", BackendKind::TimeSeries),
    ])
    .0
}

// ============================================================================
// Time-Series Affinity
// ============================================================================

/// Test the canonical tick query lands on the time-series kind.
#[test]
fn test_tick_query_routes_to_time_series() {
    let router = standard();
    let query = QueryDescriptor::read("tick_data")
        .with_filter("symbol", FilterValue::eq("AAPL"))
        .with_filter("min_timestamp", FilterValue::gte("2024-01-01T00:00:00Z"));

    let decision = router.route(&query).unwrap();

    assert_eq!(decision.backend_kind(), BackendKind::TimeSeries);
    assert!(decision.confidence >= 0.7);
    assert_eq!(decision.executor_id(), "ts-1");
}

/// Test every time-series entity name without joins routes confidently.
#[test]
fn test_time_series_names_route_confidently() {
    let router = standard();

    for entity in ["minute_bars", "sensor_readings", "market.ticks", "TickData", "daily_ohlcv"] {
        let decision = router.route(&QueryDescriptor::read(entity)).unwrap();
        assert_eq!(decision.backend_kind(), BackendKind::TimeSeries, "{entity}");
        assert!(decision.confidence >= 0.7, "{entity}");
        assert!(!decision.ambiguous, "{entity}");
    }
}

/// Test appends to time-series tables prefer the time-series kind.
#[test]
fn test_time_series_append_routes_to_time_series() {
    let router = standard();
    let query = QueryDescriptor::insert(
        "tick_data",
        vec![serde_json::json!({"symbol": "AAPL", "price": 1.0})],
    );

    let decision = router.route(&query).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::TimeSeries);
}

// ============================================================================
// Relational Affinity
// ============================================================================

/// Test the canonical join plus group-by query lands on the relational kind.
#[test]
fn test_join_with_group_by_routes_to_relational() {
    let router = standard();
    let query = QueryDescriptor::read("orders")
        .with_join(JoinClause::inner("users"))
        .with_group_by(["users.id"]);

    let decision = router.route(&query).unwrap();

    assert_eq!(decision.backend_kind(), BackendKind::Relational);
    assert!(decision.is_confident());
}

/// Test joins win over a time-series entity name.
#[test]
fn test_join_on_time_series_entity_routes_to_relational() {
    let router = standard();
    let query = QueryDescriptor::read("tick_data")
        .with_join(JoinClause::inner("symbols"))
        .with_group_by(["symbols.sector"]);

    let decision = router.route(&query).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::Relational);
}

/// Test descriptors requiring transactions go to the relational kind.
#[test]
fn test_transaction_requirement_routes_to_relational() {
    let router = standard();
    let query = QueryDescriptor::insert("tick_data", vec![serde_json::json!({"price": 1.0})])
        .requiring("transactions");

    let decision = router.route(&query).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::Relational);
}

// ============================================================================
// Fallback and Availability
// ============================================================================

/// Test unmatched descriptors fall back to the fixed order and are flagged.
#[test]
fn test_unmatched_descriptor_is_ambiguous() {
    let router = standard();
    let decision = router.route(&QueryDescriptor::read("customers")).unwrap();

    assert!(decision.ambiguous);
    assert_eq!(decision.confidence, 0.5);
    assert_eq!(decision.backend_kind(), BackendKind::Relational);
}

/// Test a matched kind with no live executor falls through to another kind.
#[test]
fn test_matched_kind_without_live_executor_falls_through() {
    let (router, executors) = router(&[
        ("pg-1", BackendKind::Relational),
        ("ts-1", BackendKind::TimeSeries),
    ]);
    router.set_live("ts-1", false);
    assert_eq!(executors.len(), 2);

    let decision = router.route(&QueryDescriptor::read("tick_data")).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::Relational);
}

/// Test routing with no registered executors fails.
#[test]
fn test_no_executors_is_an_error() {
    let (router, _) = router(&[]);
    let err = router.route(&QueryDescriptor::read("tick_data")).unwrap_err();

    assert!(matches!(err, RoutingError::NoBackendAvailable { .. }));
}

/// Test alternatives list other live instances after the primary.
#[test]
fn test_alternatives_follow_primary() {
    let (router, _) = router(&[
        ("ts-1", BackendKind::TimeSeries),
        ("ts-2", BackendKind::TimeSeries),
        ("pg-1", BackendKind::Relational),
    ]);

    let decision = router.route(&QueryDescriptor::read("tick_data")).unwrap();
    let ids: Vec<&str> = decision.candidates().map(|c| c.executor_id()).collect();

    assert!(decision.alternatives.len() <= 2);
    assert!(!decision.alternatives.is_empty());
    assert!(!ids[1..].contains(&ids[0]));
}

/// Test least-loaded selection returns a live instance of the kind.
#[test]
fn test_least_loaded_selection() {
    let (router, _) = router(&[
        ("ts-1", BackendKind::TimeSeries),
        ("ts-2", BackendKind::TimeSeries),
    ]);

    let executor = router
        .select_executor(BackendKind::TimeSeries, SelectionPolicy::LeastLoaded, &[])
        .unwrap();
    assert_eq!(executor.kind(), BackendKind::TimeSeries);
}

// ============================================================================
// Rule Management
// ============================================================================

/// Test a custom rule with a higher priority overrides the built-ins.
#[test]
fn test_custom_rule_takes_precedence() {
    let router = standard();
    router.add_rule(
        RoutingRule::new("archive_to_relational", BackendKind::Relational, |q| {
            q.entity.starts_with("archived_")
        })
        .with_priority(9),
    );

    let decision = router.route(&QueryDescriptor::read("archived_ticks")).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::Relational);
    assert_eq!(decision.matched_rules[0], "archive_to_relational");

    assert!(router.set_rule_enabled("archive_to_relational", false));
    let decision = router.route(&QueryDescriptor::read("archived_ticks")).unwrap();
    assert_eq!(decision.backend_kind(), BackendKind::TimeSeries);
}

/// Test routing metrics count decisions per kind.
#[test]
fn test_routing_metrics() {
    let router = standard();
    router.route(&QueryDescriptor::read("tick_data")).unwrap();
    router.route(&QueryDescriptor::read("customers")).unwrap();

    let metrics = router.metrics();
    assert_eq!(metrics.total_routes, 2);
    assert_eq!(metrics.fallback_routes, 1);
}
