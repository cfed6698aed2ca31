//! Unit rollback orchestration
//!
//! Rolls back a named unit of deployed functionality:
//! 1. Resolve the unit from the [`UnitRegistry`]
//! 2. Capture pre-state (toggle value, file existence and sizes, dependencies)
//! 3. Disable the feature toggle
//! 4. Run the compensating script with `REASON` and `DRY_RUN`
//! 5. Validate: toggle disabled, files absent, optional validation script
//!
//! Every step is attempted and recorded; failures mark the report
//! `FAILED` instead of returning an error. Only an unknown unit id is an
//! error. Rolling back an already rolled-back unit is not special-cased.

mod registry;
mod script;
mod toggles;

pub use registry::{UnitDefinition, UnitRegistry};
pub use script::{ScriptOutput, ScriptRunner, DEFAULT_SCRIPT_TIMEOUT};
pub use toggles::{FeatureToggleStore, InMemoryToggleStore, JsonFileToggleStore};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{EventSink, Notification, Severity, WardenError, WardenResult};

/// Final state of a unit rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    /// Script succeeded and validation passed
    Completed,
    /// Script or validation failed
    Failed,
}

/// Existence and size of a registered file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileState {
    /// Path
    pub path: PathBuf,
    /// Whether it exists
    pub exists: bool,
    /// Size in bytes when it exists
    pub size: Option<u64>,
}

/// State captured before anything is changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreState {
    /// Toggle value; `None` when unknown or unreadable
    pub toggle_enabled: Option<bool>,
    /// Registered files
    pub files: Vec<FileState>,
    /// Declared dependencies
    pub dependencies: Vec<String>,
}

/// Post-condition findings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Failed post-conditions
    pub errors: Vec<String>,
    /// Things worth a look
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// No errors
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Structured outcome of a unit rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    /// Unit id
    pub unit_id: String,
    /// Reason given by the caller
    pub reason: String,
    /// Dry run: toggle untouched, script told via `DRY_RUN=true`
    pub dry_run: bool,
    /// Final state
    pub status: RollbackStatus,
    /// Feature toggle
    pub feature_toggle: String,
    /// Captured pre-state
    pub pre_state: PreState,
    /// Whether the toggle write succeeded
    pub toggle_disabled: bool,
    /// Compensating script run; absent when it could not start
    pub script: Option<ScriptOutput>,
    /// Validation script run
    pub validation_script: Option<ScriptOutput>,
    /// Post-condition findings
    pub validation: ValidationReport,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

impl RollbackReport {
    /// Whether the rollback completed
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RollbackStatus::Completed
    }

    /// Error describing a failed rollback; script failures take precedence
    #[must_use]
    pub fn to_error(&self) -> Option<WardenError> {
        if self.succeeded() {
            return None;
        }
        if let Some(err) = self.script.as_ref().and_then(ScriptOutput::to_error) {
            return Some(err);
        }
        Some(WardenError::RollbackValidationFailed(self.validation.errors.clone()))
    }
}

/// Orchestrates unit rollbacks
pub struct StoryRollbackOrchestrator {
    registry: UnitRegistry,
    toggles: Arc<dyn FeatureToggleStore>,
    runner: ScriptRunner,
    events: Arc<dyn EventSink>,
}

impl StoryRollbackOrchestrator {
    /// Orchestrator over a registry and a toggle store
    #[must_use]
    pub fn new(
        registry: UnitRegistry,
        toggles: Arc<dyn FeatureToggleStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            toggles,
            runner: ScriptRunner::default(),
            events,
        }
    }

    /// With a custom script runner
    #[inline]
    #[must_use]
    pub fn with_runner(mut self, runner: ScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Registry in use
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Roll back one unit
    pub async fn rollback_unit(
        &self,
        unit_id: &str,
        reason: &str,
        dry_run: bool,
    ) -> WardenResult<RollbackReport> {
        let unit = self
            .registry
            .get(unit_id)
            .ok_or_else(|| WardenError::UnknownUnit(unit_id.to_string()))?;
        let span = tracing::info_span!("unit_rollback", unit_id, dry_run);
        let report = self.run(unit, reason, dry_run).instrument(span).await;
        self.emit(&report);
        Ok(report)
    }

    async fn run(&self, unit: &UnitDefinition, reason: &str, dry_run: bool) -> RollbackReport {
        let started_at = Utc::now();
        let mut validation = ValidationReport::default();

        let pre_state = self.capture(unit, &mut validation).await;
        if !unit.dependencies.is_empty() {
            validation.warnings.push(format!(
                "unit depends on {}; dependent functionality may change",
                unit.dependencies.join(", ")
            ));
        }

        let toggle_disabled = if dry_run {
            validation
                .warnings
                .push(format!("dry run: toggle {} left unchanged", unit.feature_toggle));
            false
        } else {
            match self.toggles.set(&unit.feature_toggle, false).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(toggle = %unit.feature_toggle, error = %e, "cannot disable toggle");
                    validation
                        .errors
                        .push(format!("cannot disable toggle {}: {e}", unit.feature_toggle));
                    false
                }
            }
        };

        let env = vec![
            ("REASON", reason.to_string()),
            ("DRY_RUN", dry_run.to_string()),
            ("UNIT_ID", unit.id.clone()),
        ];
        let script = match self.runner.run(&unit.script, &env).await {
            Ok(output) => {
                if !output.success() {
                    validation.errors.push(format!(
                        "rollback script exited with {:?}{}",
                        output.exit_code,
                        if output.timed_out { " (timed out)" } else { "" }
                    ));
                }
                Some(output)
            }
            Err(e) => {
                validation.errors.push(e.to_string());
                None
            }
        };

        self.validate(unit, dry_run, &mut validation).await;
        let validation_script = match &unit.validation_script {
            Some(path) => match self.runner.run(path, &env).await {
                Ok(output) => {
                    if !output.success() {
                        validation.errors.push(format!(
                            "validation script exited with {:?}: {}",
                            output.exit_code,
                            output.stderr.trim()
                        ));
                    }
                    Some(output)
                }
                Err(e) => {
                    validation.errors.push(e.to_string());
                    None
                }
            },
            None => None,
        };

        let completed = script.as_ref().is_some_and(ScriptOutput::success) && validation.passed();
        RollbackReport {
            unit_id: unit.id.clone(),
            reason: reason.to_string(),
            dry_run,
            status: if completed {
                RollbackStatus::Completed
            } else {
                RollbackStatus::Failed
            },
            feature_toggle: unit.feature_toggle.clone(),
            pre_state,
            toggle_disabled,
            script,
            validation_script,
            validation,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn capture(&self, unit: &UnitDefinition, validation: &mut ValidationReport) -> PreState {
        let toggle_enabled = match self.toggles.get(&unit.feature_toggle).await {
            Ok(Some(value)) => Some(value),
            Ok(None) => {
                validation
                    .warnings
                    .push(format!("toggle {} not found in store", unit.feature_toggle));
                None
            }
            Err(e) => {
                validation
                    .warnings
                    .push(format!("cannot read toggle {}: {e}", unit.feature_toggle));
                None
            }
        };
        if toggle_enabled == Some(false) {
            tracing::info!(toggle = %unit.feature_toggle, "toggle already disabled");
        }

        let mut files = Vec::with_capacity(unit.files.len());
        for path in &unit.files {
            let meta = tokio::fs::metadata(path).await.ok();
            files.push(FileState {
                path: path.clone(),
                exists: meta.is_some(),
                size: meta.map(|m| m.len()),
            });
        }
        PreState {
            toggle_enabled,
            files,
            dependencies: unit.dependencies.clone(),
        }
    }

    async fn validate(&self, unit: &UnitDefinition, dry_run: bool, validation: &mut ValidationReport) {
        if !dry_run {
            match self.toggles.get(&unit.feature_toggle).await {
                Ok(Some(false)) => {}
                Ok(other) => validation.errors.push(format!(
                    "toggle {} is {other:?} after rollback",
                    unit.feature_toggle
                )),
                Err(e) => validation
                    .errors
                    .push(format!("cannot confirm toggle {}: {e}", unit.feature_toggle)),
            }
        }
        for path in &unit.files {
            if tokio::fs::try_exists(path).await.unwrap_or(true) {
                let finding = format!("{} still exists", path.display());
                if dry_run {
                    validation.warnings.push(finding);
                } else {
                    validation.errors.push(finding);
                }
            }
        }
    }

    fn emit(&self, report: &RollbackReport) {
        self.events.audit(
            AuditOperation::UnitRollback,
            AuditOutcome::from_success(report.succeeded()),
            json!({
                "unitId": report.unit_id,
                "reason": report.reason,
                "dryRun": report.dry_run,
                "status": report.status,
                "exitCode": report.script.as_ref().and_then(|s| s.exit_code),
                "errors": report.validation.errors,
                "warnings": report.validation.warnings,
            }),
        );
        let notification = if report.succeeded() {
            Notification::new(
                Severity::Warning,
                "Unit rolled back",
                format!("unit {} rolled back: {}", report.unit_id, report.reason),
            )
        } else {
            Notification::new(
                Severity::Critical,
                "Unit rollback failed",
                format!(
                    "unit {} rollback failed: {}",
                    report.unit_id,
                    report.validation.errors.join("; ")
                ),
            )
            .with_action("Inspect the script output and finish the rollback manually")
        };
        self.events
            .notify(notification.with_context("unitId", report.unit_id.clone()));
        tracing::info!(unit_id = %report.unit_id, status = ?report.status, "unit rollback finished");
    }
}

impl std::fmt::Debug for StoryRollbackOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryRollbackOrchestrator")
            .field("units", &self.registry.len())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
