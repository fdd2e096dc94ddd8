//! Query routing.
//!
//! - [`analyzer`] - pure heuristics that classify descriptors
//! - [`rules`] - routing rules and the built-in rule set
//! - [`router`] - rule evaluation, confidence scoring and instance selection
//! - [`health`] - background health monitoring feeding executor liveness

pub mod analyzer;
pub mod health;
pub mod router;
pub mod rules;

pub use analyzer::{QueryAnalysis, QueryAnalyzer, QueryComplexity, QueryFeature};
pub use health::{BackendHealthStatus, HealthMonitor, HealthReport, HealthStatus};
pub use router::{
    Candidate, QueryRouter, RoutingDecision, RoutingError, RoutingMetrics, SelectionPolicy,
};
pub use rules::{RoutingRule, RoutingStrategy, default_routing_rules};
