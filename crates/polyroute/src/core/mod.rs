//! Core abstractions shared by the router, the optimizer and the access manager.
//!
//! - [`BackendExecutor`] - uniform contract over storage engines
//! - [`CapabilityProfile`] - what an engine kind supports
//! - [`CapabilityRegistry`] - profiles by kind, with introspection and fallback

pub mod backend;
pub mod capabilities;

pub use backend::{BackendExecutor, BackendKind, DynExecutor, ExecutorConfig, PoolStats};
pub use capabilities::{CapabilityProfile, CapabilityRegistry, FeatureCategory, PerformanceLevel};
