//! Polyroute probe
//!
//! Wires a relational and a time-series in-memory executor behind an
//! [`AccessManager`], runs a scripted set of queries and prints routing
//! decisions, metrics and health as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use polyroute::access::{AccessConfig, AccessManager, ExecutionMode, RetryConfig};
use polyroute::backends::{FaultKind, MemoryExecutor};
use polyroute::core::BackendKind;
use polyroute::query::{FilterValue, JoinClause, QueryDescriptor};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Probe configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "polyroute-probe")]
#[command(about = "Routes a scripted workload across in-memory executors")]
struct ProbeConfig {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "POLYROUTE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Execution mode (auto, failover, load-balanced, relational, time-series).
    #[arg(long, env = "POLYROUTE_MODE", default_value = "auto")]
    mode: String,

    /// Make the time-series executor unavailable to exercise failover.
    #[arg(long, env = "POLYROUTE_FAIL_TIME_SERIES", default_value = "false")]
    fail_time_series: bool,

    /// Simulated executor latency in milliseconds.
    #[arg(long, env = "POLYROUTE_LATENCY_MS", default_value = "0")]
    latency_ms: u64,

    /// Request timeout in milliseconds.
    #[arg(long, env = "POLYROUTE_REQUEST_TIMEOUT_MS", default_value = "5000")]
    request_timeout_ms: u64,

    /// Maximum retries per executor.
    #[arg(long, env = "POLYROUTE_MAX_RETRIES", default_value = "1")]
    max_retries: u32,

    /// Pretty-print the JSON report.
    #[arg(long, env = "POLYROUTE_PRETTY", default_value = "true")]
    pretty: bool,
}

impl ProbeConfig {
    fn execution_mode(&self) -> anyhow::Result<ExecutionMode> {
        match self.mode.to_ascii_lowercase().as_str() {
            "auto" | "auto-route" => Ok(ExecutionMode::AutoRoute),
            "failover" => Ok(ExecutionMode::Failover),
            "load-balanced" | "balanced" => Ok(ExecutionMode::LoadBalanced),
            other => other
                .parse::<BackendKind>()
                .map(ExecutionMode::Pinned)
                .map_err(|e| anyhow::anyhow!("invalid mode: {}", e)),
        }
    }

    fn access_config(&self) -> anyhow::Result<AccessConfig> {
        let retry = RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let (config, warnings) = AccessConfig::builder()
            .mode(self.execution_mode()?)
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .retry(retry)
            .build_with_warnings()?;
        for warning in warnings {
            warn!(%warning, "configuration warning");
        }
        Ok(config)
    }
}

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("polyroute={},polyroute_probe={}", level, level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn seed(relational: &MemoryExecutor, time_series: &MemoryExecutor) {
    relational.insert_rows(
        "users",
        vec![
            json!({"id": 1, "name": "ada", "region": "eu"}),
            json!({"id": 2, "name": "grace", "region": "us"}),
        ],
    );
    relational.insert_rows(
        "orders",
        vec![
            json!({"id": 10, "user_id": 1, "total": 120.0}),
            json!({"id": 11, "user_id": 1, "total": 35.5}),
            json!({"id": 12, "user_id": 2, "total": 80.0}),
        ],
    );
    time_series.insert_rows(
        "tick_data",
        vec![
            json!({"symbol": "AAPL", "timestamp": "2026-10-19T09:30:00Z", "price": 190.5}),
            json!({"symbol": "MSFT", "timestamp": "2026-10-19T09:30:00Z", "price": 410.2}),
        ],
    );
}

fn workload() -> Vec<(&'static str, QueryDescriptor)> {
    vec![
        (
            "latest ticks",
            QueryDescriptor::read("tick_data")
                .with_filter("symbol", FilterValue::eq("AAPL"))
                .with_filter("timestamp", FilterValue::gte("2026-10-19T00:00:00Z")),
        ),
        (
            "orders per user",
            QueryDescriptor::read("orders")
                .with_join(JoinClause::inner("users").on("user_id", "id"))
                .with_group_by(["users.name"]),
        ),
        (
            "append ticks",
            QueryDescriptor::insert(
                "tick_data",
                vec![json!({"symbol": "AAPL", "timestamp": "2026-10-19T09:31:00Z", "price": 190.9})],
            ),
        ),
        ("unmatched entity", QueryDescriptor::read("customers")),
        (
            "latest ticks again",
            QueryDescriptor::read("tick_data")
                .with_filter("symbol", FilterValue::eq("AAPL"))
                .with_filter("timestamp", FilterValue::gte("2026-10-19T00:00:00Z")),
        ),
    ]
}

async fn run_step(manager: &AccessManager, label: &str, query: &QueryDescriptor) -> Value {
    let routing = match manager.router().route(query) {
        Ok(decision) => json!({
            "kind": decision.backend_kind(),
            "executor": decision.executor_id(),
            "confidence": decision.confidence,
            "ambiguous": decision.ambiguous,
            "rationale": decision.rationale,
            "matched_rules": decision.matched_rules,
            "alternatives": decision
                .alternatives
                .iter()
                .map(|c| format!("{}#{}", c.kind, c.executor_id()))
                .collect::<Vec<_>>(),
        }),
        Err(err) => json!({ "error": err.to_string() }),
    };

    let outcome = match manager.execute(query).await {
        Ok(result) => json!({
            "executor": result.executor_id,
            "rows": result.rows,
            "affected_rows": result.affected_rows,
        }),
        Err(err) => json!({
            "error": err.to_string(),
            "trail": err.trail(),
        }),
    };

    json!({ "step": label, "routing": routing, "outcome": outcome })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ProbeConfig::parse();
    init_logging(&config.log_level);
    let access_config = config.access_config()?;

    let relational = Arc::new(MemoryExecutor::new("relational-1", BackendKind::Relational));
    let time_series = Arc::new(MemoryExecutor::new("time-series-1", BackendKind::TimeSeries));
    seed(&relational, &time_series);

    if config.latency_ms > 0 {
        let latency = Duration::from_millis(config.latency_ms);
        relational.set_latency(latency);
        time_series.set_latency(latency);
    }
    if config.fail_time_series {
        time_series.fail_always(FaultKind::Unavailable);
    }

    info!(mode = %config.mode, fail_time_series = config.fail_time_series, "starting probe");
    let manager = AccessManager::new(
        access_config,
        vec![relational.clone(), time_series.clone()],
    )?;

    let mut steps = Vec::new();
    for (label, query) in workload() {
        steps.push(run_step(&manager, label, &query).await);
    }

    let health = manager.perform_health_check().await;
    let report = json!({
        "steps": steps,
        "metrics": manager.get_metrics(),
        "routing_metrics": manager.get_routing_metrics(),
        "optimization": manager.get_optimization_statistics(),
        "health": health,
    });

    let rendered = if config.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", rendered);

    manager.shutdown().await;
    Ok(())
}
