//! Warden Core - shared vocabulary of the pressure controller
//!
//! Everything the pressure and recovery crates have in common:
//! - Pressure samples, response tiers and operation identifiers
//! - The error taxonomy
//! - Configuration loading and validation
//! - The engine adapter seam and the swappable engine slot
//! - Admission and maintenance gates
//! - Memory probes
//! - Notifications and the hash-chained audit log
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::prelude::*;
//!
//! let config = WardenConfig::load("warden.toml")?;
//! let events = NotificationManager::with_default_sinks(config.audit.capacity);
//! events.notify(Notification::new(Severity::Advisory, "started", "warden is up"));
//! ```

#![warn(unreachable_pub)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod notify;
pub mod probe;
pub mod sql;
pub mod types;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditLog, AuditOperation, AuditOutcome};
pub use config::{
    CloudFallbackConfig, FallbackProvider, RecoveryConfig, RemediationConfig, ThresholdConfig,
    TimeoutConfig, WardenConfig,
};
pub use engine::{EngineAdapter, EngineConfig, EngineSlot, QueryResult, TableInfo};
pub use error::{ConfigError, EngineError, WardenError, WardenResult};
pub use gate::{ActiveOperationSource, Admission, MaintenanceLock};
pub use notify::{EventSink, Notification, NotificationManager, NotificationSink, Severity};
pub use probe::{EngineMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use types::{
    ConnectionId, OperationClass, OperationId, PressureSample, ResponseTier, TrackedOperation,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Warden
    pub use crate::{
        Admission, EngineAdapter, EngineConfig, EngineSlot, EventSink, MaintenanceLock,
        Notification, NotificationManager, OperationClass, OperationId, PressureSample,
        ResponseTier, Severity, WardenConfig, WardenError, WardenResult,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
