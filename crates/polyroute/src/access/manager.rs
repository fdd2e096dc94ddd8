//! The access manager.
//!
//! [`AccessManager`] is the caller-facing entry point. It composes the
//! capability registry, router and optimizer around the registered
//! executors and adds result caching, retry, failover, per-kind
//! concurrency limits, transaction delegation, batching and metrics.
//!
//! # Request Flow
//!
//! ```text
//! execute(query)
//!   ├─ optimize(query, tentative kind)        if optimization is enabled
//!   ├─ cache lookup                           reads only, if caching is enabled
//!   ├─ route(optimized)                       or route_pinned in pinned mode
//!   ├─ dispatch(primary)                      timeout + retry with backoff
//!   ├─ dispatch(alternatives...)              if failover is enabled
//!   └─ cache store / invalidate, metrics
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use polyroute::access::{AccessConfig, AccessManager};
//! use polyroute::backends::MemoryExecutor;
//! use polyroute::core::BackendKind;
//! use polyroute::query::QueryDescriptor;
//!
//! # tokio_test::block_on(async {
//! let manager = AccessManager::new(
//!     AccessConfig::default(),
//!     vec![
//!         Arc::new(MemoryExecutor::new("pg-1", BackendKind::Relational)),
//!         Arc::new(MemoryExecutor::new("ts-1", BackendKind::TimeSeries)),
//!     ],
//! )
//! .unwrap();
//!
//! let result = manager.fetch(&QueryDescriptor::read("tick_data")).await.unwrap();
//! assert_eq!(result.executor_id.as_deref(), Some("ts-1"));
//! # });
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::core::{BackendKind, CapabilityRegistry, DynExecutor};
use crate::error::{AccessError, AccessResult, AttemptFailure, BackendError, DecisionTrail};
use crate::optimizer::{ExecutionPlan, OptimizationStatistics, QueryOptimizer};
use crate::query::{FilterValue, QueryDescriptor, QueryResult};
use crate::routing::{
    Candidate, HealthMonitor, HealthReport, QueryRouter, RoutingDecision, RoutingError,
    RoutingMetrics, SelectionPolicy,
};

use super::cache::{CacheStats, ResultCache};
use super::config::{AccessConfig, ExecutionMode};
use super::metrics::{AccessMetrics, MetricsSnapshot};

/// Handle to a transaction opened through the access manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHandle {
    /// Handle id.
    pub id: String,
    /// Kind of the owning executor.
    pub backend_kind: BackendKind,
    /// Owning executor.
    pub executor_id: String,
}

#[derive(Debug, Clone)]
struct OpenTransaction {
    executor: DynExecutor,
    backend_id: String,
    written: Vec<String>,
}

enum DispatchFailure {
    Backend(BackendError),
    Timeout { timeout_ms: u64 },
}

impl DispatchFailure {
    fn render(&self) -> String {
        match self {
            DispatchFailure::Backend(err) => err.to_string(),
            DispatchFailure::Timeout { timeout_ms } => format!("timed out after {}ms", timeout_ms),
        }
    }
}

struct Inner {
    config: AccessConfig,
    registry: Arc<CapabilityRegistry>,
    router: Arc<QueryRouter>,
    optimizer: Arc<QueryOptimizer>,
    cache: ResultCache,
    metrics: AccessMetrics,
    limits: Mutex<HashMap<BackendKind, Arc<Semaphore>>>,
    transactions: Mutex<HashMap<String, OpenTransaction>>,
    monitor: HealthMonitor,
}

/// Routes, optimizes and executes descriptors against registered executors.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct AccessManager {
    inner: Arc<Inner>,
}

impl AccessManager {
    /// Creates a manager over the given executors.
    pub fn new(config: AccessConfig, executors: Vec<DynExecutor>) -> AccessResult<Self> {
        let registry = Arc::new(CapabilityRegistry::new());
        let router = Arc::new(QueryRouter::new(registry.clone()));
        let optimizer = Arc::new(QueryOptimizer::with_analyzer(router.analyzer().clone()));

        let manager = Self::with_components(config, registry, router, optimizer)?;
        for executor in executors {
            manager.register_executor(executor);
        }
        Ok(manager)
    }

    /// Creates a manager from pre-built components.
    pub fn with_components(
        config: AccessConfig,
        registry: Arc<CapabilityRegistry>,
        router: Arc<QueryRouter>,
        optimizer: Arc<QueryOptimizer>,
    ) -> AccessResult<Self> {
        for warning in config.validate()? {
            warn!(%warning, "access configuration warning");
        }
        if let ExecutionMode::Pinned(kind) = config.mode {
            router.declare_kind(kind);
        }

        let monitor = HealthMonitor::new(config.health.clone());
        let cache = ResultCache::new(config.cache_max_entries, config.cache_ttl);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                router,
                optimizer,
                cache,
                metrics: AccessMetrics::new(),
                limits: Mutex::new(HashMap::new()),
                transactions: Mutex::new(HashMap::new()),
                monitor,
            }),
        })
    }

    /// Registers an executor with the router and as a capability source.
    pub fn register_executor(&self, executor: DynExecutor) {
        self.inner.registry.register_source(executor.clone());
        self.inner.router.register(executor);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    /// Returns the capability registry.
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    /// Returns the router.
    pub fn router(&self) -> &Arc<QueryRouter> {
        &self.inner.router
    }

    /// Returns the optimizer.
    pub fn optimizer(&self) -> &Arc<QueryOptimizer> {
        &self.inner.optimizer
    }

    // ========================================================================
    // Request path
    // ========================================================================

    /// Executes a descriptor.
    #[instrument(skip(self, query), fields(entity = %query.entity, operation = %query.operation))]
    pub async fn execute(&self, query: &QueryDescriptor) -> AccessResult<QueryResult> {
        self.inner.metrics.record_request();
        let result = self.execute_inner(query).await;
        self.inner.metrics.record_outcome(result.is_ok());
        if let Err(ref err) = result {
            debug!(error = %err, "request failed");
        }
        result
    }

    /// Executes a read descriptor.
    pub async fn fetch(&self, query: &QueryDescriptor) -> AccessResult<QueryResult> {
        self.execute(query).await
    }

    /// Inserts rows into an entity.
    pub async fn save(&self, entity: &str, rows: Vec<Value>) -> AccessResult<QueryResult> {
        self.execute(&QueryDescriptor::insert(entity, rows)).await
    }

    /// Applies `changes` to rows of an entity matching `filters`.
    pub async fn update(
        &self,
        entity: &str,
        filters: BTreeMap<String, FilterValue>,
        changes: Value,
    ) -> AccessResult<QueryResult> {
        self.execute(&QueryDescriptor::update(entity, filters, changes))
            .await
    }

    /// Deletes rows of an entity matching `filters`.
    pub async fn delete(
        &self,
        entity: &str,
        filters: BTreeMap<String, FilterValue>,
    ) -> AccessResult<QueryResult> {
        self.execute(&QueryDescriptor::delete(entity, filters)).await
    }

    /// Executes reads concurrently. Results keep the input order.
    pub async fn batch_fetch(&self, queries: Vec<QueryDescriptor>) -> AccessResult<Vec<QueryResult>> {
        self.fan_out(queries).await
    }

    /// Inserts several row sets concurrently. Results keep the input order.
    pub async fn batch_save(&self, writes: Vec<(String, Vec<Value>)>) -> AccessResult<Vec<QueryResult>> {
        let queries = writes
            .into_iter()
            .map(|(entity, rows)| QueryDescriptor::insert(entity, rows))
            .collect();
        self.fan_out(queries).await
    }

    /// Estimates the execution plan on the kind the descriptor would route to.
    pub fn explain(&self, query: &QueryDescriptor) -> AccessResult<ExecutionPlan> {
        let kind = self.tentative_kind(query, &DecisionTrail::default())?;
        Ok(self.inner.optimizer.analyze_execution_plan(query, kind))
    }

    async fn fan_out(&self, queries: Vec<QueryDescriptor>) -> AccessResult<Vec<QueryResult>> {
        let total = queries.len();
        let mut tasks: JoinSet<(usize, AccessResult<QueryResult>)> = JoinSet::new();

        for (index, query) in queries.into_iter().enumerate() {
            let manager = self.clone();
            tasks.spawn(async move { (index, manager.execute(&query).await) });
        }

        let mut slots: Vec<Option<QueryResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(err))) => {
                    warn!(index, error = %err, "batch item failed; cancelling the rest");
                    tasks.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(AccessError::ExecutionFailed {
                        attempts: Vec::new(),
                        trail: DecisionTrail::default(),
                        source: Some(BackendError::Internal {
                            backend_name: "batch".to_string(),
                            message: join_err.to_string(),
                            source: None,
                        }),
                    });
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    async fn execute_inner(&self, query: &QueryDescriptor) -> AccessResult<QueryResult> {
        let inner = &self.inner;
        let mut trail = DecisionTrail::default();

        let optimized = if inner.config.enable_optimization {
            let kind = self.tentative_kind(query, &trail)?;
            let result = inner.optimizer.optimize(query, kind);
            trail.applied_rules = result.applied_rules;
            trail.optimization_warnings = result.warnings;
            result.optimized
        } else {
            query.clone()
        };

        let is_write = optimized.operation.is_write();
        let cacheable = inner.config.enable_caching && !is_write;
        let cache_key = optimized.cache_key();
        if cacheable {
            if let Some(hit) = inner.cache.get(&cache_key) {
                inner.metrics.record_cache_hit();
                debug!(key = %cache_key, "cache hit");
                return Ok(hit);
            }
            inner.metrics.record_cache_miss();
        }

        let decision = self.route(&optimized, &mut trail)?;
        let candidates = self.candidates(&decision);

        let mut attempts = Vec::new();
        let mut last_backend_error = None;
        let mut all_timeouts = true;
        let mut last_timeout_ms = 0;

        for (index, candidate) in candidates.iter().enumerate() {
            trail.record_attempt(candidate.kind, candidate.executor_id());
            if index > 0 {
                warn!(
                    kind = %candidate.kind,
                    executor = candidate.executor_id(),
                    attempt = index + 1,
                    "failing over"
                );
            }

            match self.dispatch(candidate, &optimized).await {
                Ok(result) => {
                    if index > 0 {
                        inner.metrics.record_fallback();
                    }
                    if is_write {
                        for entity in optimized.touched_entities() {
                            inner.cache.invalidate_entity(&entity);
                        }
                    } else if cacheable {
                        inner.cache.insert(cache_key, &optimized, result.clone());
                    }
                    return Ok(result);
                }
                Err(failure) => {
                    attempts.push(AttemptFailure {
                        backend_kind: candidate.kind,
                        executor_id: candidate.executor_id().to_string(),
                        error: failure.render(),
                    });
                    match failure {
                        DispatchFailure::Backend(err) => {
                            all_timeouts = false;
                            if !err.permits_failover() {
                                let operation = match &err {
                                    BackendError::UnsupportedCapability { capability, .. } => capability.clone(),
                                    other => other.to_string(),
                                };
                                return Err(AccessError::UnsupportedOperation {
                                    backend_kind: candidate.kind,
                                    operation,
                                    trail,
                                });
                            }
                            last_backend_error = Some(err);
                        }
                        DispatchFailure::Timeout { timeout_ms } => {
                            last_timeout_ms = timeout_ms;
                        }
                    }
                }
            }
        }

        Err(terminal_error(attempts, last_backend_error, all_timeouts, last_timeout_ms, trail))
    }

    fn tentative_kind(&self, query: &QueryDescriptor, trail: &DecisionTrail) -> AccessResult<BackendKind> {
        match self.inner.config.mode {
            ExecutionMode::Pinned(kind) => Ok(kind),
            _ => self
                .inner
                .router
                .resolve_kind(query)
                .map_err(|err| no_backend(err, trail.clone())),
        }
    }

    fn route(&self, query: &QueryDescriptor, trail: &mut DecisionTrail) -> AccessResult<RoutingDecision> {
        let inner = &self.inner;
        let policy = match inner.config.mode {
            ExecutionMode::LoadBalanced => SelectionPolicy::LeastLoaded,
            _ => SelectionPolicy::RoundRobin,
        };

        let routed = match inner.config.mode {
            ExecutionMode::Pinned(kind) => inner.router.route_pinned(query, kind, policy),
            _ => inner.router.route_with_policy(query, policy),
        };
        let decision = routed.map_err(|err| no_backend(err, trail.clone()))?;

        trail.routed_kind = Some(decision.backend_kind());
        trail.confidence = Some(decision.confidence);
        trail.rationale = Some(decision.rationale.clone());

        if decision.ambiguous && inner.config.strict_routing {
            return Err(AccessError::RoutingAmbiguous {
                entity: query.entity.clone(),
                confidence: decision.confidence,
                trail: trail.clone(),
            });
        }
        Ok(decision)
    }

    fn candidates(&self, decision: &RoutingDecision) -> Vec<Candidate> {
        let config = &self.inner.config;
        if !config.enable_failover {
            return vec![decision.primary.clone()];
        }
        let mut candidates: Vec<Candidate> = decision.candidates().cloned().collect();
        if config.mode == ExecutionMode::Failover {
            candidates.extend(self.inner.router.failover_candidates(decision));
        }
        candidates
    }

    fn limit_for(&self, kind: BackendKind) -> Arc<Semaphore> {
        self.inner
            .limits
            .lock()
            .entry(kind)
            .or_insert_with(|| Arc::new(Semaphore::new(self.inner.config.pool_limit_for(kind))))
            .clone()
    }

    /// Runs one candidate with the request timeout, retrying retryable errors.
    async fn dispatch(&self, candidate: &Candidate, query: &QueryDescriptor) -> Result<QueryResult, DispatchFailure> {
        let inner = &self.inner;
        let retry = &inner.config.retry;
        let timeout = inner.config.request_timeout;
        let semaphore = self.limit_for(candidate.kind);
        let executor_id = candidate.executor_id();
        let mut attempt = 0;

        loop {
            // The permit wait counts against the request timeout.
            let start = Instant::now();
            let guarded = async {
                match semaphore.acquire().await {
                    Ok(_permit) => candidate.executor.execute_query(query).await,
                    Err(_) => Err(BackendError::PoolExhausted {
                        backend_name: executor_id.to_string(),
                    }),
                }
            };
            let outcome = match tokio::time::timeout(timeout, guarded).await {
                Ok(Ok(mut result)) => {
                    inner
                        .metrics
                        .record_dispatch(executor_id, candidate.kind, start.elapsed());
                    result
                        .executor_id
                        .get_or_insert_with(|| executor_id.to_string());
                    return Ok(result);
                }
                Ok(Err(err)) => DispatchFailure::Backend(err),
                Err(_) => DispatchFailure::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
            };

            inner.metrics.record_dispatch_error(executor_id, candidate.kind);
            match outcome {
                DispatchFailure::Backend(ref err) if err.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    debug!(executor = executor_id, attempt, ?delay, error = %err, "retrying");
                    inner.metrics.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                DispatchFailure::Timeout { .. } => {
                    inner.metrics.record_timeout();
                    return Err(outcome);
                }
                DispatchFailure::Backend(_) => return Err(outcome),
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begins a transaction on the first kind that supports transactions
    /// and has a live executor. Pinned mode uses the pinned kind.
    pub async fn begin_transaction(&self) -> AccessResult<TransactionHandle> {
        let router = &self.inner.router;
        let kind = match self.inner.config.mode {
            ExecutionMode::Pinned(kind) => kind,
            _ => {
                let mut kinds = router.kinds();
                kinds.sort_by_key(|k| {
                    BackendKind::FALLBACK_ORDER
                        .iter()
                        .position(|f| f == k)
                        .unwrap_or(usize::MAX)
                });
                let live: Vec<BackendKind> = kinds
                    .into_iter()
                    .filter(|k| router.has_live_executor(*k))
                    .collect();
                match live
                    .iter()
                    .find(|k| self.inner.registry.describe(**k).supports_transactions())
                    .or(live.first())
                {
                    Some(kind) => *kind,
                    None => {
                        return Err(AccessError::NoBackendAvailable {
                            entity: "transaction".to_string(),
                            trail: DecisionTrail::default(),
                        });
                    }
                }
            }
        };
        self.begin_transaction_on(kind).await
    }

    /// Begins a transaction on a specific kind.
    pub async fn begin_transaction_on(&self, kind: BackendKind) -> AccessResult<TransactionHandle> {
        let mut trail = DecisionTrail {
            routed_kind: Some(kind),
            rationale: Some("transaction".to_string()),
            ..Default::default()
        };

        if !self.inner.registry.describe(kind).supports_transactions() {
            return Err(AccessError::UnsupportedOperation {
                backend_kind: kind,
                operation: "transactions".to_string(),
                trail,
            });
        }

        let executor = self
            .inner
            .router
            .select_executor(kind, SelectionPolicy::RoundRobin, &[])
            .ok_or_else(|| AccessError::NoBackendAvailable {
                entity: "transaction".to_string(),
                trail: trail.clone(),
            })?;
        trail.record_attempt(kind, executor.id());

        let backend_id = executor
            .begin_transaction()
            .await
            .map_err(|err| transaction_error(kind, executor.id(), err, trail))?;

        let handle = TransactionHandle {
            id: uuid::Uuid::new_v4().to_string(),
            backend_kind: kind,
            executor_id: executor.id().to_string(),
        };
        self.inner.transactions.lock().insert(
            handle.id.clone(),
            OpenTransaction {
                executor,
                backend_id,
                written: Vec::new(),
            },
        );
        info!(transaction = %handle.id, kind = %kind, executor = %handle.executor_id, "transaction started");
        Ok(handle)
    }

    /// Executes a descriptor inside a transaction on its owning executor.
    pub async fn execute_in_transaction(
        &self,
        handle: &TransactionHandle,
        query: &QueryDescriptor,
    ) -> AccessResult<QueryResult> {
        let open = self.open_transaction(handle)?;
        let mut trail = DecisionTrail {
            routed_kind: Some(handle.backend_kind),
            rationale: Some(format!("transaction {}", handle.id)),
            ..Default::default()
        };
        trail.record_attempt(handle.backend_kind, &handle.executor_id);

        let timeout = self.inner.config.request_timeout;
        let call = open.executor.execute_in_transaction(&open.backend_id, query);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                return Err(transaction_error(handle.backend_kind, &handle.executor_id, err, trail));
            }
            Err(_) => {
                return Err(AccessError::ExecutionTimeout {
                    backend: handle.executor_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                    trail,
                });
            }
        };

        if query.operation.is_write() {
            if let Some(open) = self.inner.transactions.lock().get_mut(&handle.id) {
                for entity in query.touched_entities() {
                    if !open.written.contains(&entity) {
                        open.written.push(entity);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Commits a transaction and invalidates cached results it affected.
    pub async fn commit_transaction(&self, handle: &TransactionHandle) -> AccessResult<()> {
        let open = self.take_transaction(handle)?;
        let trail = DecisionTrail {
            routed_kind: Some(handle.backend_kind),
            attempted_backends: vec![format!("{}#{}", handle.backend_kind, handle.executor_id)],
            ..Default::default()
        };
        open.executor
            .commit_transaction(&open.backend_id)
            .await
            .map_err(|err| transaction_error(handle.backend_kind, &handle.executor_id, err, trail))?;

        for entity in &open.written {
            self.inner.cache.invalidate_entity(entity);
        }
        info!(transaction = %handle.id, "transaction committed");
        Ok(())
    }

    /// Rolls back a transaction.
    pub async fn rollback_transaction(&self, handle: &TransactionHandle) -> AccessResult<()> {
        let open = self.take_transaction(handle)?;
        let trail = DecisionTrail {
            routed_kind: Some(handle.backend_kind),
            attempted_backends: vec![format!("{}#{}", handle.backend_kind, handle.executor_id)],
            ..Default::default()
        };
        open.executor
            .rollback_transaction(&open.backend_id)
            .await
            .map_err(|err| transaction_error(handle.backend_kind, &handle.executor_id, err, trail))?;
        info!(transaction = %handle.id, "transaction rolled back");
        Ok(())
    }

    fn open_transaction(&self, handle: &TransactionHandle) -> AccessResult<OpenTransaction> {
        self.inner
            .transactions
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| AccessError::TransactionNotFound {
                transaction_id: handle.id.clone(),
            })
    }

    fn take_transaction(&self, handle: &TransactionHandle) -> AccessResult<OpenTransaction> {
        self.inner
            .transactions
            .lock()
            .remove(&handle.id)
            .ok_or_else(|| AccessError::TransactionNotFound {
                transaction_id: handle.id.clone(),
            })
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Returns access metrics.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Returns routing metrics.
    pub fn get_routing_metrics(&self) -> RoutingMetrics {
        self.inner.router.metrics()
    }

    /// Returns optimizer statistics.
    pub fn get_optimization_statistics(&self) -> OptimizationStatistics {
        self.inner.optimizer.statistics()
    }

    /// Returns result cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Drops every cached result.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Probes every executor now and returns the aggregated report.
    pub async fn perform_health_check(&self) -> HealthReport {
        self.inner.monitor.check_now(&self.inner.router).await
    }

    /// Starts the background health-check loop.
    pub fn start_health_monitor(&self) -> JoinHandle<()> {
        self.inner.monitor.start(self.inner.router.clone())
    }

    /// Stops the background health-check loop.
    pub async fn stop_health_monitor(&self) {
        self.inner.monitor.stop().await;
    }

    /// Returns true while the background health-check loop runs.
    pub fn is_health_monitor_running(&self) -> bool {
        self.inner.monitor.is_running()
    }

    /// Stops health monitoring and disconnects every executor.
    pub async fn shutdown(&self) {
        self.stop_health_monitor().await;
        for executor in self.inner.router.executors() {
            if let Err(err) = executor.disconnect().await {
                warn!(executor = executor.id(), error = %err, "disconnect failed");
            }
        }
        info!("access manager shut down");
    }
}

impl std::fmt::Debug for AccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessManager")
            .field("mode", &self.inner.config.mode)
            .field("router", &self.inner.router)
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

fn no_backend(err: RoutingError, mut trail: DecisionTrail) -> AccessError {
    match err {
        RoutingError::NoBackendAvailable { entity, skipped } => {
            if !skipped.is_empty() {
                trail.rationale = Some(format!("skipped: {}", skipped.join(", ")));
            }
            AccessError::NoBackendAvailable { entity, trail }
        }
    }
}

fn terminal_error(
    attempts: Vec<AttemptFailure>,
    last_backend_error: Option<BackendError>,
    all_timeouts: bool,
    last_timeout_ms: u64,
    trail: DecisionTrail,
) -> AccessError {
    let last_executor = attempts
        .last()
        .map(|a| a.executor_id.clone())
        .unwrap_or_default();

    if all_timeouts && !attempts.is_empty() {
        return AccessError::ExecutionTimeout {
            backend: last_executor,
            timeout_ms: last_timeout_ms,
            trail,
        };
    }

    match last_backend_error {
        Some(err) if attempts.len() == 1 && err.is_unavailable() => AccessError::BackendUnavailable {
            backend: last_executor,
            message: err.to_string(),
            trail,
        },
        source => AccessError::ExecutionFailed {
            attempts,
            trail,
            source,
        },
    }
}

fn transaction_error(
    kind: BackendKind,
    executor_id: &str,
    err: BackendError,
    trail: DecisionTrail,
) -> AccessError {
    match err {
        BackendError::UnsupportedCapability { capability, .. } => AccessError::UnsupportedOperation {
            backend_kind: kind,
            operation: capability,
            trail,
        },
        err if err.is_unavailable() => AccessError::BackendUnavailable {
            backend: executor_id.to_string(),
            message: err.to_string(),
            trail,
        },
        err => AccessError::ExecutionFailed {
            attempts: vec![AttemptFailure {
                backend_kind: kind,
                executor_id: executor_id.to_string(),
                error: err.to_string(),
            }],
            trail,
            source: Some(err),
        },
    }
}
