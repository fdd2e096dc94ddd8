//! Integration tests for the access manager.
//!
//! Exercises the full request path (optimize, cache, route, dispatch,
//! failover) and the health, batch and transaction surfaces against
//! scripted in-memory executors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use polyroute::access::{AccessConfig, AccessManager, ExecutionMode, RetryConfig};
use polyroute::backends::{FaultKind, MemoryExecutor};
use polyroute::core::{BackendExecutor, BackendKind};
use polyroute::error::AccessError;
use polyroute::query::{FilterValue, JoinClause, QueryDescriptor};
use polyroute::routing::HealthStatus;

struct Harness {
    manager: AccessManager,
    pg: Arc<MemoryExecutor>,
    ts: Arc<MemoryExecutor>,
}

fn harness(config: AccessConfig) -> Harness {
    let pg = Arc::new(MemoryExecutor::new("pg-1", BackendKind::Relational));
    let ts = Arc::new(MemoryExecutor::new("ts-1", BackendKind::TimeSeries));

    pg.insert_rows(
        "users",
        vec![json!({"id": 1, "name": "ada"}), json!({"id": 2, "name": "grace"})],
    );
    pg.insert_rows(
        "orders",
        vec![
            json!({"id": 10, "user_id": 1, "total": 5}),
            json!({"id": 11, "user_id": 1, "total": 7}),
            json!({"id": 12, "user_id": 2, "total": 9}),
        ],
    );
    ts.insert_rows(
        "tick_data",
        vec![
            json!({"symbol": "AAPL", "min_timestamp": "2024-01-02", "price": 190.5}),
            json!({"symbol": "MSFT", "min_timestamp": "2024-01-02", "price": 410.0}),
        ],
    );

    let manager = AccessManager::new(config, vec![pg.clone(), ts.clone()]).unwrap();
    Harness { manager, pg, ts }
}

fn without_retries() -> AccessConfig {
    AccessConfig::builder()
        .retry(RetryConfig::none())
        .build()
        .unwrap()
}

fn tick_query() -> QueryDescriptor {
    QueryDescriptor::read("tick_data")
        .with_filter("symbol", FilterValue::eq("AAPL"))
        .with_filter("min_timestamp", FilterValue::gte("2024-01-01"))
}

// ============================================================================
// Routing Through the Manager
// ============================================================================

/// Test the tick scenario executes on the time-series executor.
#[tokio::test]
async fn test_tick_query_executes_on_time_series() {
    let h = harness(AccessConfig::default());
    let result = h.manager.fetch(&tick_query()).await.unwrap();

    assert_eq!(result.executor_id.as_deref(), Some("ts-1"));
    assert_eq!(result.len(), 1);
    assert_eq!(h.pg.execution_count(), 0);
}

/// Test the join scenario executes on the relational executor.
#[tokio::test]
async fn test_join_query_executes_on_relational() {
    let h = harness(AccessConfig::default());
    let query = QueryDescriptor::read("orders")
        .with_join(JoinClause::inner("users"))
        .with_group_by(["users.id"]);

    let result = h.manager.fetch(&query).await.unwrap();
    assert_eq!(result.executor_id.as_deref(), Some("pg-1"));
    assert_eq!(result.len(), 2);
}

/// Test pinned mode bypasses the rule catalog.
#[tokio::test]
async fn test_pinned_mode() {
    let config = AccessConfig::builder()
        .pinned(BackendKind::Relational)
        .build()
        .unwrap();
    let h = harness(config);

    let result = h.manager.fetch(&tick_query()).await.unwrap();
    assert_eq!(result.executor_id.as_deref(), Some("pg-1"));
    assert_eq!(h.manager.get_routing_metrics().pinned_routes, 1);
}

/// Test a query whose only kind has no executor raises NoBackendAvailable.
#[tokio::test]
async fn test_no_executor_for_only_kind() {
    let config = AccessConfig::builder()
        .pinned(BackendKind::TimeSeries)
        .build()
        .unwrap();
    let pg = Arc::new(MemoryExecutor::new("pg-1", BackendKind::Relational));
    let manager = AccessManager::new(config, vec![pg]).unwrap();

    let err = manager.fetch(&tick_query()).await.unwrap_err();
    assert!(matches!(err, AccessError::NoBackendAvailable { .. }));
    assert_eq!(manager.get_metrics().failed_requests, 1);
}

/// Test a manager with no executors at all.
#[tokio::test]
async fn test_no_executors_registered() {
    let manager = AccessManager::new(AccessConfig::default(), Vec::new()).unwrap();
    let err = manager.fetch(&tick_query()).await.unwrap_err();

    assert!(matches!(err, AccessError::NoBackendAvailable { .. }));
}

// ============================================================================
// Caching
// ============================================================================

/// Test structurally identical descriptors share a cache entry.
#[tokio::test]
async fn test_identical_descriptors_hit_cache() {
    let h = harness(AccessConfig::default());
    let a = tick_query();
    let b = QueryDescriptor::read("tick_data")
        .with_filter("min_timestamp", FilterValue::gte("2024-01-01"))
        .with_filter("symbol", FilterValue::eq("AAPL"));
    assert_eq!(a.cache_key(), b.cache_key());

    h.manager.fetch(&a).await.unwrap();
    h.manager.fetch(&b).await.unwrap();

    let metrics = h.manager.get_metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(h.ts.execution_count(), 1);
}

/// Test disabling the cache sends every read to the executor.
#[tokio::test]
async fn test_caching_disabled() {
    let config = AccessConfig::builder().caching(false).build().unwrap();
    let h = harness(config);

    h.manager.fetch(&tick_query()).await.unwrap();
    h.manager.fetch(&tick_query()).await.unwrap();

    assert_eq!(h.ts.execution_count(), 2);
    assert_eq!(h.manager.get_metrics().cache_hits, 0);
}

/// Test a write invalidates cached reads of the same entity.
#[tokio::test]
async fn test_save_invalidates_cached_reads() {
    let h = harness(AccessConfig::default());
    let read = QueryDescriptor::read("tick_data");
    assert_eq!(h.manager.fetch(&read).await.unwrap().len(), 2);

    h.manager
        .save("tick_data", vec![json!({"symbol": "IBM", "price": 170.0})])
        .await
        .unwrap();

    assert_eq!(h.manager.fetch(&read).await.unwrap().len(), 3);
    assert_eq!(h.manager.get_metrics().cache_hits, 0);
}

/// Test delete removes matching rows and refreshes reads.
#[tokio::test]
async fn test_delete() {
    let h = harness(AccessConfig::default());
    let mut filters = BTreeMap::new();
    filters.insert("user_id".to_string(), FilterValue::eq(1));

    let result = h.manager.delete("orders", filters).await.unwrap();
    assert_eq!(result.affected_rows, 2);
    assert_eq!(h.pg.rows("orders").len(), 1);
}

// ============================================================================
// Failover and Retry
// ============================================================================

/// Test an unavailable primary fails over to a healthy alternative.
#[tokio::test]
async fn test_unavailable_primary_fails_over() {
    let h = harness(without_retries());
    h.ts.fail_always(FaultKind::Unavailable);

    let result = h.manager.fetch(&tick_query()).await.unwrap();

    assert_eq!(result.executor_id.as_deref(), Some("pg-1"));
    let metrics = h.manager.get_metrics();
    assert_eq!(metrics.fallback_uses, 1);
    assert_eq!(metrics.successful_requests, 1);
}

/// Test failover mode widens candidates to every live executor.
#[tokio::test]
async fn test_failover_mode_reaches_every_executor() {
    let config = AccessConfig::builder()
        .mode(ExecutionMode::Failover)
        .retry(RetryConfig::none())
        .build()
        .unwrap();
    let h = harness(config);
    let extra = Arc::new(MemoryExecutor::new("ts-2", BackendKind::TimeSeries));
    h.manager.register_executor(extra.clone());

    h.ts.fail_always(FaultKind::Unavailable);
    h.pg.fail_always(FaultKind::Unavailable);
    extra.fail_always(FaultKind::Unavailable);

    let err = h.manager.fetch(&tick_query()).await.unwrap_err();
    match err {
        AccessError::ExecutionFailed { ref attempts, .. } => assert_eq!(attempts.len(), 3),
        other => panic!("unexpected error: {other}"),
    }
}

/// Test transient errors are retried on the same executor.
#[tokio::test(start_paused = true)]
async fn test_transient_error_is_retried() {
    let h = harness(AccessConfig::default());
    h.ts.fail_next(1, FaultKind::PoolExhausted);

    let result = h.manager.fetch(&tick_query()).await.unwrap();
    assert_eq!(result.executor_id.as_deref(), Some("ts-1"));
    assert_eq!(h.manager.get_metrics().retries, 1);
}

/// Test unsupported capabilities surface immediately without failover.
#[tokio::test]
async fn test_unsupported_capability_is_not_failed_over() {
    let config = AccessConfig::builder()
        .pinned(BackendKind::TimeSeries)
        .build()
        .unwrap();
    let h = harness(config);
    let query = QueryDescriptor::read("tick_data").with_join(JoinClause::inner("symbols"));

    let err = h.manager.fetch(&query).await.unwrap_err();
    assert!(matches!(
        err,
        AccessError::UnsupportedOperation {
            backend_kind: BackendKind::TimeSeries,
            ..
        }
    ));
    assert_eq!(h.pg.execution_count(), 0);
}

/// Test every terminal error carries the decision trail.
#[tokio::test]
async fn test_errors_carry_decision_trail() {
    let config = AccessConfig::builder()
        .retry(RetryConfig::none())
        .failover(false)
        .build()
        .unwrap();
    let h = harness(config);
    h.ts.fail_always(FaultKind::Query);

    let err = h.manager.fetch(&tick_query()).await.unwrap_err();
    let trail = err.trail().unwrap();

    assert_eq!(trail.attempted_backends, vec!["time-series#ts-1"]);
    assert_eq!(trail.routed_kind, Some(BackendKind::TimeSeries));
    assert!(trail.confidence.unwrap() >= 0.7);
    assert!(!trail.applied_rules.is_empty());
}

/// Test a slow executor hits the request timeout.
#[tokio::test(start_paused = true)]
async fn test_request_timeout() {
    let config = AccessConfig::builder()
        .request_timeout(Duration::from_millis(100))
        .failover(false)
        .build()
        .unwrap();
    let h = harness(config);
    h.ts.set_latency(Duration::from_secs(5));

    let err = h.manager.fetch(&tick_query()).await.unwrap_err();
    assert!(matches!(err, AccessError::ExecutionTimeout { .. }));
}

// ============================================================================
// Batches
// ============================================================================

/// Test batch reads keep input order across kinds.
#[tokio::test]
async fn test_batch_fetch_order() {
    let h = harness(AccessConfig::default());
    h.ts.set_latency(Duration::from_millis(25));

    let results = h
        .manager
        .batch_fetch(vec![
            tick_query(),
            QueryDescriptor::read("users"),
            QueryDescriptor::read("orders"),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].executor_id.as_deref(), Some("ts-1"));
    assert_eq!(results[1].len(), 2);
    assert_eq!(results[2].len(), 3);
}

/// Test one failing item fails the whole batch.
#[tokio::test]
async fn test_batch_fetch_fails_fast() {
    let config = AccessConfig::builder()
        .retry(RetryConfig::none())
        .failover(false)
        .build()
        .unwrap();
    let h = harness(config);
    h.ts.fail_always(FaultKind::Query);

    let result = h
        .manager
        .batch_fetch(vec![QueryDescriptor::read("users"), tick_query()])
        .await;
    assert!(result.is_err());
}

// ============================================================================
// Transactions
// ============================================================================

/// Test rollback discards writes made inside the transaction.
#[tokio::test]
async fn test_transaction_rollback() {
    let h = harness(AccessConfig::default());
    let tx = h.manager.begin_transaction().await.unwrap();
    assert_eq!(tx.executor_id, "pg-1");

    h.manager
        .execute_in_transaction(&tx, &QueryDescriptor::insert("users", vec![json!({"id": 3})]))
        .await
        .unwrap();
    h.manager.rollback_transaction(&tx).await.unwrap();

    assert_eq!(h.pg.rows("users").len(), 2);
    assert!(matches!(
        h.manager.rollback_transaction(&tx).await,
        Err(AccessError::TransactionNotFound { .. })
    ));
}

/// Test transactions are refused when no transactional kind is registered.
#[tokio::test]
async fn test_transaction_without_transactional_backend() {
    let ts = Arc::new(MemoryExecutor::new("ts-1", BackendKind::TimeSeries));
    let manager = AccessManager::new(AccessConfig::default(), vec![ts]).unwrap();

    let err = manager.begin_transaction().await.unwrap_err();
    assert!(matches!(err, AccessError::UnsupportedOperation { .. }));
}

// ============================================================================
// Health
// ============================================================================

/// Test aggregated health is degraded when a kind has no healthy executor.
#[tokio::test]
async fn test_health_degraded_when_kind_unhealthy() {
    let h = harness(AccessConfig::default());
    assert_eq!(h.manager.perform_health_check().await.status, HealthStatus::Healthy);

    h.pg.set_healthy(false);
    let report = h.manager.perform_health_check().await;

    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.backends.get("relational"), Some(&false));
    assert_eq!(report.backends.get("time-series"), Some(&true));
}

/// Test health failures never surface as request errors.
#[tokio::test]
async fn test_unhealthy_backend_is_routed_around() {
    let h = harness(AccessConfig::default());
    h.ts.set_healthy(false);
    h.manager.perform_health_check().await;

    let result = h.manager.fetch(&tick_query()).await.unwrap();
    assert_eq!(result.executor_id.as_deref(), Some("pg-1"));
}

/// Test the background monitor starts and stops.
#[tokio::test]
async fn test_health_monitor_lifecycle() {
    let config = AccessConfig::builder()
        .health_check_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let h = harness(config);

    let handle = h.manager.start_health_monitor();
    assert!(h.manager.is_health_monitor_running());
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.manager.stop_health_monitor().await;
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!h.manager.is_health_monitor_running());
    assert_eq!(h.ts.kind(), BackendKind::TimeSeries);
}
