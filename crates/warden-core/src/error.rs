//! Error types for Warden
//!
//! Provides the failure taxonomy shared by every component:
//! - Engine adapter failures
//! - Resource exhaustion and hung operations
//! - Recovery, fallback and rollback failures
//! - Configuration errors

use crate::notify::Severity;
use crate::types::OperationId;
use std::time::Duration;

/// Errors reported by an [`EngineAdapter`](crate::engine::EngineAdapter)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Query was rejected or failed inside the engine
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Engine did not answer in time
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    /// Engine is down or unreachable
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// Adapter does not implement the call
    #[error("unsupported by adapter: {0}")]
    Unsupported(String),

    /// Handle was closed
    #[error("engine handle closed")]
    Closed,
}

impl EngineError {
    /// Whether this points at the engine itself being gone
    #[inline]
    #[must_use]
    pub fn indicates_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed | Self::Timeout(_))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the file
    #[error("cannot read config {path}: {source}")]
    Read {
        /// Path that failed
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Main Warden error type
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Memory pressure could not be relieved locally
    #[error("resource exhaustion at {usage_percent:.1}% memory")]
    ResourceExhaustion {
        /// Usage when the failure was reported
        usage_percent: f64,
    },

    /// Operation exceeded its budget and could not be stopped
    #[error("operation {id} hung for {age_secs}s")]
    OperationHung {
        /// Operation that hung
        id: OperationId,
        /// Age in seconds
        age_secs: u64,
    },

    /// Engine is down and local recovery did not bring it back
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Fallback session could not be established
    #[error("fallback activation failed: {0}")]
    FallbackActivationFailed(String),

    /// A single compensating step failed
    #[error("rollback step {step} failed: {reason}")]
    RollbackStepFailed {
        /// Step name
        step: String,
        /// Failure detail
        reason: String,
    },

    /// Post-rollback validation found problems
    #[error("rollback validation failed: {}", .0.join("; "))]
    RollbackValidationFailed(Vec<String>),

    /// External script exited non-zero or could not run
    #[error("script {script} failed (exit {exit_code:?}): {stderr}")]
    ExternalScriptFailed {
        /// Script path
        script: String,
        /// Exit code, absent when killed or not started
        exit_code: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// Engine adapter error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No such operation
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    /// Operation id already in progress
    #[error("operation already active: {0}")]
    OperationAlreadyActive(OperationId),

    /// Unit id not present in the rollback registry
    #[error("unknown rollback unit: {0}")]
    UnknownUnit(String),

    /// New work refused
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WardenError {
    /// Whether automatic remediation can still resolve this
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion { .. }
                | Self::OperationHung { .. }
                | Self::EngineUnavailable(_)
                | Self::RollbackStepFailed { .. }
                | Self::AdmissionRejected(_)
                | Self::Engine(_)
        )
    }

    /// Whether an operator has to step in
    #[inline]
    #[must_use]
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::FallbackActivationFailed(_)
                | Self::RollbackValidationFailed(_)
                | Self::ExternalScriptFailed { .. }
        )
    }

    /// Severity used when the error is surfaced as a notification
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::FallbackActivationFailed(_) | Self::ResourceExhaustion { .. } => {
                Severity::Emergency
            }
            Self::EngineUnavailable(_)
            | Self::RollbackValidationFailed(_)
            | Self::ExternalScriptFailed { .. } => Severity::Critical,
            Self::OperationHung { .. } | Self::RollbackStepFailed { .. } => Severity::Warning,
            Self::Engine(e) if e.indicates_unavailable() => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

/// Result alias used across the workspace
pub type WardenResult<T> = Result<T, WardenError>;
