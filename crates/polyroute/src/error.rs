//! Error types for the routing layer.
//!
//! Errors are split into two tiers: [`BackendError`] is what an executor
//! reports about a single call against a storage engine, and [`AccessError`]
//! is what the [`AccessManager`](crate::access::AccessManager) surfaces to
//! callers once routing, retry and failover have run their course.
//!
//! Every terminal [`AccessError`] carries a [`DecisionTrail`] describing which
//! backends were attempted and which routing and optimization decisions led
//! there.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::access::config::ConfigError;
use crate::core::BackendKind;

/// Errors reported by a backend executor.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend is currently unavailable.
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// The requested capability is not supported by this backend.
    #[error("capability '{capability}' not supported by {backend_name}")]
    UnsupportedCapability {
        backend_name: String,
        capability: String,
    },

    /// Query execution error.
    #[error("query execution failed on {backend_name}: {message}")]
    QueryError {
        backend_name: String,
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("call to {backend_name} timed out after {timeout_ms}ms")]
    Timeout {
        backend_name: String,
        timeout_ms: u64,
    },

    /// Internal backend error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BackendError {
    /// Returns true if the same executor may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable { .. }
                | BackendError::ConnectionFailed { .. }
                | BackendError::PoolExhausted { .. }
                | BackendError::Internal { .. }
        )
    }

    /// Returns true if another backend may be tried after this error.
    ///
    /// Feature-support errors are surfaced immediately.
    pub fn permits_failover(&self) -> bool {
        !matches!(self, BackendError::UnsupportedCapability { .. })
    }

    /// Returns true if this error means the backend could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable { .. } | BackendError::ConnectionFailed { .. }
        )
    }

    /// Returns the name of the backend that produced this error.
    pub fn backend_name(&self) -> &str {
        match self {
            BackendError::Unavailable { backend_name, .. }
            | BackendError::ConnectionFailed { backend_name, .. }
            | BackendError::PoolExhausted { backend_name }
            | BackendError::UnsupportedCapability { backend_name, .. }
            | BackendError::QueryError { backend_name, .. }
            | BackendError::Timeout { backend_name, .. }
            | BackendError::Internal { backend_name, .. } => backend_name,
        }
    }
}

/// One failed attempt against a backend executor.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    /// Kind of the attempted backend.
    pub backend_kind: BackendKind,
    /// Identifier of the attempted executor.
    pub executor_id: String,
    /// Rendered error.
    pub error: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}: {}", self.backend_kind, self.executor_id, self.error)
    }
}

/// Routing and optimization context attached to terminal errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionTrail {
    /// Attempted backends in order, rendered as `kind#executor`.
    pub attempted_backends: Vec<String>,
    /// Kind chosen by the router, if routing got that far.
    pub routed_kind: Option<BackendKind>,
    /// Routing confidence.
    pub confidence: Option<f64>,
    /// Routing rationale.
    pub rationale: Option<String>,
    /// Optimization rules applied before routing.
    pub applied_rules: Vec<String>,
    /// Non-fatal optimization warnings.
    pub optimization_warnings: Vec<String>,
}

impl DecisionTrail {
    /// Records an attempted backend.
    pub fn record_attempt(&mut self, kind: BackendKind, executor_id: &str) {
        self.attempted_backends
            .push(format!("{}#{}", kind, executor_id));
    }
}

impl fmt::Display for DecisionTrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempted=[{}]", self.attempted_backends.join(", "))?;
        if let Some(kind) = self.routed_kind {
            write!(f, " routed={}", kind)?;
        }
        if let Some(confidence) = self.confidence {
            write!(f, " confidence={:.2}", confidence)?;
        }
        if let Some(ref rationale) = self.rationale {
            write!(f, " rationale=\"{}\"", rationale)?;
        }
        if !self.applied_rules.is_empty() {
            write!(f, " rules=[{}]", self.applied_rules.join(", "))?;
        }
        if !self.optimization_warnings.is_empty() {
            write!(f, " warnings={}", self.optimization_warnings.len())?;
        }
        Ok(())
    }
}

/// Errors surfaced to callers of the access manager.
#[derive(Error, Debug)]
pub enum AccessError {
    /// No routing match and no live fallback executor.
    #[error("no backend available for '{entity}' ({trail})")]
    NoBackendAvailable { entity: String, trail: DecisionTrail },

    /// The chosen executor could not be reached.
    #[error("backend {backend} unavailable: {message} ({trail})")]
    BackendUnavailable {
        backend: String,
        message: String,
        trail: DecisionTrail,
    },

    /// The resolved backend does not support the requested operation.
    #[error("operation '{operation}' not supported by {backend_kind} ({trail})")]
    UnsupportedOperation {
        backend_kind: BackendKind,
        operation: String,
        trail: DecisionTrail,
    },

    /// An optimization rule failed. Downgraded to a warning by the optimizer.
    #[error("optimization rule '{rule}' failed: {message}")]
    OptimizationRuleFailure { rule: String, message: String },

    /// Routing fell back to the fixed order and strict routing is enabled.
    #[error("ambiguous routing for '{entity}' (confidence {confidence:.2}, {trail})")]
    RoutingAmbiguous {
        entity: String,
        confidence: f64,
        trail: DecisionTrail,
    },

    /// A dispatched call exceeded the request timeout.
    #[error("execution on {backend} timed out after {timeout_ms}ms ({trail})")]
    ExecutionTimeout {
        backend: String,
        timeout_ms: u64,
        trail: DecisionTrail,
    },

    /// Execution failed on every attempted backend.
    #[error(
        "execution failed after {} attempt(s): [{}] ({trail})",
        .attempts.len(),
        .attempts.iter().map(|a| a.to_string()).collect::<Vec<_>>().join("; ")
    )]
    ExecutionFailed {
        attempts: Vec<AttemptFailure>,
        trail: DecisionTrail,
        #[source]
        source: Option<BackendError>,
    },

    /// The transaction handle is unknown or already finished.
    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound { transaction_id: String },

    /// The configuration is invalid.
    #[error(transparent)]
    InvalidConfiguration(#[from] ConfigError),
}

impl AccessError {
    /// Returns the decision trail for terminal errors.
    pub fn trail(&self) -> Option<&DecisionTrail> {
        match self {
            AccessError::NoBackendAvailable { trail, .. }
            | AccessError::BackendUnavailable { trail, .. }
            | AccessError::UnsupportedOperation { trail, .. }
            | AccessError::RoutingAmbiguous { trail, .. }
            | AccessError::ExecutionTimeout { trail, .. }
            | AccessError::ExecutionFailed { trail, .. } => Some(trail),
            AccessError::OptimizationRuleFailure { .. }
            | AccessError::TransactionNotFound { .. }
            | AccessError::InvalidConfiguration(_) => None,
        }
    }

    /// Returns the attempted backends recorded on this error.
    pub fn attempted_backends(&self) -> &[String] {
        self.trail()
            .map(|t| t.attempted_backends.as_slice())
            .unwrap_or(&[])
    }
}

/// Result type alias for executor calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type alias for access manager operations.
pub type AccessResult<T> = Result<T, AccessError>;

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Internal {
            backend_name: "unknown".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
