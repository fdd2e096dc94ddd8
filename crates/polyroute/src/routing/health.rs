//! Health monitoring for backend executors.
//!
//! This module provides periodic health checking of every executor known to
//! a [`QueryRouter`], feeding the router's liveness flags so routing skips
//! executors that fail their probes.
//!
//! # Features
//!
//! - Periodic health checks on a background task
//! - Failure detection with configurable thresholds
//! - Aggregated status: healthy only if every kind has a healthy instance
//!
//! Probe failures are recorded and logged. They never surface as request
//! errors.
//!
//! # Example
//!
//! ```ignore
//! use polyroute::routing::HealthMonitor;
//!
//! let monitor = HealthMonitor::new(config.health.clone());
//! let handle = monitor.start(router.clone());
//!
//! if let Some(report) = monitor.last_report() {
//!     println!("{}", report.status);
//! }
//! monitor.stop().await;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::access::config::HealthConfig;
use crate::core::{BackendExecutor, BackendKind};

use super::router::QueryRouter;

/// Health status for a single executor.
#[derive(Debug, Clone)]
pub struct BackendHealthStatus {
    /// Executor identifier.
    pub executor_id: String,

    /// Whether the executor is currently healthy.
    pub is_healthy: bool,

    /// Last successful health check.
    pub last_success: Option<Instant>,

    /// Last failed health check.
    pub last_failure: Option<Instant>,

    /// Consecutive failure count.
    pub consecutive_failures: u32,

    /// Consecutive success count.
    pub consecutive_successes: u32,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// Average response time in milliseconds.
    pub avg_response_time_ms: f64,

    response_times: Vec<u64>,
}

impl BackendHealthStatus {
    /// Creates a new health status. Executors start healthy.
    pub fn new(executor_id: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            is_healthy: true,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            avg_response_time_ms: 0.0,
            response_times: Vec::with_capacity(10),
        }
    }

    /// Records a successful health check.
    pub fn record_success(&mut self, response_time_ms: u64) {
        self.last_success = Some(Instant::now());
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_error = None;

        self.response_times.push(response_time_ms);
        if self.response_times.len() > 10 {
            self.response_times.remove(0);
        }
        self.avg_response_time_ms =
            self.response_times.iter().sum::<u64>() as f64 / self.response_times.len() as f64;
    }

    /// Records a failed health check.
    pub fn record_failure(&mut self, error: String) {
        self.last_failure = Some(Instant::now());
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_error = Some(error);
    }

    /// Updates healthy status based on thresholds.
    pub fn update_health(&mut self, failure_threshold: u32, success_threshold: u32) {
        if self.consecutive_failures >= failure_threshold {
            if self.is_healthy {
                warn!(
                    executor = %self.executor_id,
                    failures = self.consecutive_failures,
                    error = self.last_error.as_deref().unwrap_or(""),
                    "executor marked unhealthy"
                );
            }
            self.is_healthy = false;
        } else if self.consecutive_successes >= success_threshold {
            if !self.is_healthy {
                info!(
                    executor = %self.executor_id,
                    successes = self.consecutive_successes,
                    "executor recovered"
                );
            }
            self.is_healthy = true;
        }
    }

    /// Returns how long since the last successful check.
    pub fn time_since_success(&self) -> Option<Duration> {
        self.last_success.map(|t| t.elapsed())
    }
}

/// Aggregated health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every kind has at least one healthy instance.
    Healthy,
    /// Some kind has no healthy instance.
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health snapshot across kinds and instances.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Aggregated status.
    pub status: HealthStatus,

    /// Per kind: true if at least one instance is healthy.
    pub backends: BTreeMap<String, bool>,

    /// Per executor id.
    pub instances: BTreeMap<String, bool>,

    /// When the snapshot was taken.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Aggregates instance health over the expected kinds.
    ///
    /// A report over zero kinds is degraded.
    pub fn from_instances(
        kinds: &[BackendKind],
        instances: Vec<(BackendKind, String, bool)>,
    ) -> Self {
        let mut backends: BTreeMap<String, bool> =
            kinds.iter().map(|k| (k.to_string(), false)).collect();
        let mut by_id = BTreeMap::new();

        for (kind, id, healthy) in instances {
            let entry = backends.entry(kind.to_string()).or_insert(false);
            *entry |= healthy;
            by_id.insert(id, healthy);
        }

        let status = if !backends.is_empty() && backends.values().all(|h| *h) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self {
            status,
            backends,
            instances: by_id,
            checked_at: Utc::now(),
        }
    }

    /// Returns true if the aggregated status is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Returns true if the kind has a healthy instance.
    pub fn kind_healthy(&self, kind: BackendKind) -> bool {
        self.backends
            .get(&kind.to_string())
            .copied()
            .unwrap_or(false)
    }
}

/// Health check result.
#[derive(Debug)]
pub enum HealthCheckResult {
    /// Health check passed.
    Healthy {
        /// Response time in milliseconds.
        response_time_ms: u64,
    },
    /// Health check failed.
    Unhealthy {
        /// Error message.
        error: String,
    },
    /// Health check timed out.
    Timeout,
}

/// Periodic health monitor.
pub struct HealthMonitor {
    config: HealthConfig,
    status: Arc<RwLock<HashMap<String, BackendHealthStatus>>>,
    report: Arc<RwLock<Option<HealthReport>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl HealthMonitor {
    /// Creates a new health monitor.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            status: Arc::new(RwLock::new(HashMap::new())),
            report: Arc::new(RwLock::new(None)),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Starts background health checking. A running loop is stopped first.
    pub fn start(&self, router: Arc<QueryRouter>) -> tokio::task::JoinHandle<()> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(previous) = self.shutdown_tx.lock().replace(tx) {
            let _ = previous.try_send(());
        }

        let config = self.config.clone();
        let status = self.status.clone();
        let report = self.report.clone();

        info!(
            interval = ?config.check_interval,
            executors = router.executors().len(),
            "starting health monitor"
        );

        tokio::spawn(async move {
            Self::health_check_loop(rx, router, config, status, report).await;
        })
    }

    /// Stops the health monitor.
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Returns true while a background loop is registered.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Runs one round of checks immediately.
    pub async fn check_now(&self, router: &QueryRouter) -> HealthReport {
        Self::run_checks(router, &self.config, &self.status, &self.report).await
    }

    /// Gets the health status for a specific executor.
    pub fn backend_status(&self, executor_id: &str) -> Option<BackendHealthStatus> {
        self.status.read().get(executor_id).cloned()
    }

    /// Returns the most recent report, if any round has completed.
    pub fn last_report(&self) -> Option<HealthReport> {
        self.report.read().clone()
    }

    /// Performs a single health check for an executor.
    pub async fn check_backend(executor: &dyn BackendExecutor, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();

        match tokio::time::timeout(timeout, executor.health_check()).await {
            Ok(true) => HealthCheckResult::Healthy {
                response_time_ms: start.elapsed().as_millis() as u64,
            },
            Ok(false) => HealthCheckResult::Unhealthy {
                error: if executor.is_connected() {
                    "health probe failed".to_string()
                } else {
                    "not connected".to_string()
                },
            },
            Err(_) => HealthCheckResult::Timeout,
        }
    }

    async fn run_checks(
        router: &QueryRouter,
        config: &HealthConfig,
        status: &RwLock<HashMap<String, BackendHealthStatus>>,
        report: &RwLock<Option<HealthReport>>,
    ) -> HealthReport {
        for executor in router.executors() {
            let result = Self::check_backend(executor.as_ref(), config.timeout).await;
            let id = executor.id().to_string();

            let healthy = {
                let mut status_map = status.write();
                let entry = status_map
                    .entry(id.clone())
                    .or_insert_with(|| BackendHealthStatus::new(&id));
                match result {
                    HealthCheckResult::Healthy { response_time_ms } => {
                        entry.record_success(response_time_ms);
                    }
                    HealthCheckResult::Unhealthy { error } => {
                        entry.record_failure(error);
                    }
                    HealthCheckResult::Timeout => {
                        entry.record_failure("health check timed out".to_string());
                    }
                }
                entry.update_health(config.failure_threshold, config.success_threshold);
                entry.is_healthy
            };

            router.set_live(&id, healthy);
        }

        let snapshot = router.health_report();
        if !snapshot.is_healthy() {
            debug!(backends = ?snapshot.backends, "health degraded");
        }
        *report.write() = Some(snapshot.clone());
        snapshot
    }

    async fn health_check_loop(
        mut shutdown_rx: mpsc::Receiver<()>,
        router: Arc<QueryRouter>,
        config: HealthConfig,
        status: Arc<RwLock<HashMap<String, BackendHealthStatus>>>,
        report: Arc<RwLock<Option<HealthReport>>>,
    ) {
        let mut interval = tokio::time::interval(config.check_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("health monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    Self::run_checks(&router, &config, &status, &report).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
