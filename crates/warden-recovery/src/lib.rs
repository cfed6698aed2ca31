//! Warden Recovery - getting the engine back, or getting around it
//!
//! This crate provides:
//! - Crash recovery: health probing and a bounded, retried recovery sequence
//! - Cloud fallback: export, connect and re-route through a translating adapter
//! - Operation rollback: checkpoints and reverse-order compensation
//! - Unit rollback: feature toggle, compensating script and validation
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_recovery::{OperationRollbackManager, OperationId};
//! use serde_json::json;
//!
//! let rollback = OperationRollbackManager::new(slot, events);
//! let id = OperationId::new("load-orders");
//! rollback.begin(id.clone(), "load", json!({ "tables": ["orders"] })).await?;
//! rollback.record_step(&id, "insert_data", json!({ "table": "orders", "rows": 500 }))?;
//! if load_failed {
//!     let result = rollback.rollback(&id, "load failed").await?;
//!     assert!(result.unresolved.is_empty());
//! }
//! ```

pub mod crash;
pub mod fallback;
pub mod rollback;
pub mod story;

pub use crash::{
    CrashRecoveryManager, HealthStatus, RecoveryAttempt, RecoveryReport, RecoveryStep, StepResult,
};
pub use fallback::{
    BackendConnector, CloudFallbackManager, DeactivationReport, FallbackReason, FallbackSession,
    FallbackTrigger, OperationStats, TranslatingAdapter, TriggerInputs,
};
pub use rollback::{
    Checkpoint, Compensator, OperationRecord, OperationRollbackManager, OperationStatus,
    RollbackResult, StepRecord,
};
pub use story::{
    FeatureToggleStore, InMemoryToggleStore, JsonFileToggleStore, RollbackReport, RollbackStatus,
    ScriptRunner, StoryRollbackOrchestrator, UnitDefinition, UnitRegistry,
};
pub use warden_core::OperationId;
