//! Polyroute
//!
//! A routing and optimization layer that sits between application code and
//! several storage engines with different strengths. Callers describe what
//! they want as a backend-neutral [`QueryDescriptor`]; the crate decides which
//! engine should serve it, rewrites it for that engine and executes it with
//! retry, failover and caching.
//!
//! # Architecture
//!
//! - [`query`] - backend-neutral descriptors, results and cache keys
//! - [`core`] - the [`BackendExecutor`] contract and the capability registry
//! - [`routing`] - query analysis, routing rules, the router and health monitoring
//! - [`optimizer`] - rule-based rewriting, cost estimates and index advice
//! - [`access`] - the [`AccessManager`] facade, configuration, cache and metrics
//! - [`backends`] - the in-process [`MemoryExecutor`]
//! - [`error`] - error types for all operations
//!
//! # Backend Kinds
//!
//! Two kinds are built in:
//!
//! | Kind | Strengths |
//! |------|-----------|
//! | [`BackendKind::Relational`] | joins, transactions, aggregation, window functions |
//! | [`BackendKind::TimeSeries`] | high-rate appends, time-bucketed reads, tag filters |
//!
//! Additional engines register as [`BackendKind::Custom`] with their own
//! capability profile and routing rules.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use polyroute::{AccessConfig, AccessManager, BackendKind, MemoryExecutor, QueryDescriptor};
//! use polyroute::query::FilterValue;
//!
//! # tokio_test::block_on(async {
//! let manager = AccessManager::new(
//!     AccessConfig::default(),
//!     vec![
//!         Arc::new(MemoryExecutor::new("pg-1", BackendKind::Relational)),
//!         Arc::new(MemoryExecutor::new("ts-1", BackendKind::TimeSeries)),
//!     ],
//! )?;
//!
//! let decision = manager.router().route(&QueryDescriptor::read("tick_data"))?;
//! assert_eq!(decision.backend_kind(), BackendKind::TimeSeries);
//!
//! let query = QueryDescriptor::read("tick_data").with_filter("symbol", FilterValue::eq("AAPL"));
//! let result = manager.fetch(&query).await?;
//! assert!(result.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

pub mod access;
pub mod backends;
pub mod core;
pub mod error;
pub mod optimizer;
pub mod query;
pub mod routing;

pub use access::{AccessConfig, AccessManager, ExecutionMode};
pub use backends::MemoryExecutor;
pub use core::{BackendExecutor, BackendKind, CapabilityProfile, CapabilityRegistry, DynExecutor};
pub use error::{AccessError, AccessResult, BackendError, BackendResult};
pub use optimizer::QueryOptimizer;
pub use query::{QueryDescriptor, QueryResult};
pub use routing::{QueryRouter, RoutingDecision};
