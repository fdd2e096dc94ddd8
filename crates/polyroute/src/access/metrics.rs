//! Access manager metrics.
//!
//! Counters are relaxed atomics; per-backend usage sits behind a mutex.
//! [`AccessMetrics::snapshot`] returns a consistent-enough copy for reporting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::BackendKind;

/// Usage of one executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendUsage {
    /// Kind of the executor.
    pub kind: Option<BackendKind>,
    /// Successful dispatches.
    pub requests: u64,
    /// Failed dispatches, including retried ones.
    pub errors: u64,
    /// Cumulative execution time of successful dispatches, in milliseconds.
    pub total_time_ms: f64,
}

impl BackendUsage {
    /// Mean execution time of successful dispatches.
    pub fn average_time_ms(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_time_ms / self.requests as f64
        }
    }
}

/// Point-in-time copy of the metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests received.
    pub total_requests: u64,
    /// Requests that returned a result.
    pub successful_requests: u64,
    /// Requests that returned an error.
    pub failed_requests: u64,
    /// Reads served from the cache.
    pub cache_hits: u64,
    /// Cacheable reads that missed.
    pub cache_misses: u64,
    /// Requests answered by a failover candidate.
    pub fallback_uses: u64,
    /// Retries against the same executor.
    pub retries: u64,
    /// Dispatches that hit the request timeout.
    pub timeouts: u64,
    /// Usage per executor id.
    pub backends: BTreeMap<String, BackendUsage>,
}

impl MetricsSnapshot {
    /// Fraction of cacheable reads served from the cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Errors recorded across all executors.
    pub fn backend_errors(&self) -> u64 {
        self.backends.values().map(|u| u.errors).sum()
    }
}

/// Process-wide access metrics, updated only by the access manager.
#[derive(Debug, Default)]
pub struct AccessMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallback_uses: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    backends: Mutex<BTreeMap<String, BackendUsage>>,
}

impl AccessMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, success: bool) {
        let counter = if success {
            &self.successful_requests
        } else {
            &self.failed_requests
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallback_uses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self, executor_id: &str, kind: BackendKind, elapsed: Duration) {
        let mut backends = self.backends.lock();
        let usage = backends.entry(executor_id.to_string()).or_default();
        usage.kind = Some(kind);
        usage.requests += 1;
        usage.total_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    pub(crate) fn record_dispatch_error(&self, executor_id: &str, kind: BackendKind) {
        let mut backends = self.backends.lock();
        let usage = backends.entry(executor_id.to_string()).or_default();
        usage.kind = Some(kind);
        usage.errors += 1;
    }

    /// Returns a copy of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fallback_uses: self.fallback_uses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            backends: self.backends.lock().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = AccessMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_outcome(true);
        metrics.record_outcome(false);
        metrics.record_dispatch("pg-1", BackendKind::Relational, Duration::from_millis(4));
        metrics.record_dispatch("pg-1", BackendKind::Relational, Duration::from_millis(2));
        metrics.record_dispatch_error("ts-1", BackendKind::TimeSeries);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.cache_hit_rate(), 0.5);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.backend_errors(), 1);

        let pg = &snapshot.backends["pg-1"];
        assert_eq!(pg.requests, 2);
        assert!((pg.average_time_ms() - 3.0).abs() < 1e-9);
        assert_eq!(snapshot.backends["ts-1"].kind, Some(BackendKind::TimeSeries));
    }

    #[test]
    fn test_empty_rates() {
        let snapshot = AccessMetrics::new().snapshot();
        assert_eq!(snapshot.cache_hit_rate(), 0.0);
        assert_eq!(snapshot.backend_errors(), 0);
    }
}
