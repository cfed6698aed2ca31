//! Crash recovery
//!
//! A health probe runs a trivial query under a short timeout. When it
//! fails, recovery takes the engine exclusively through the maintenance
//! lock and runs up to `maxRecoveryAttempts` passes of the recovery
//! sequence, with exponential backoff between passes. The first pass that
//! completes every step wins.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{
    EngineConfig, EngineSlot, EventSink, MaintenanceLock, Notification, RecoveryConfig, Severity,
    WardenConfig, WardenError,
};

/// Query used by the health probe and by validation
pub const PROBE_QUERY: &str = "SELECT 1";

const HISTORY_LIMIT: usize = 50;

/// Steps of one recovery pass, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    /// Save configuration snapshot
    CaptureState,
    /// Close every connection
    CloseConnections,
    /// Check the data file
    CheckIntegrity,
    /// Pick the data file or a backup to restore from
    Restore,
    /// Re-open the engine
    Reinitialize,
    /// Basic query and table listing
    Validate,
    /// Emit the completion event
    EmitEvent,
}

impl RecoveryStep {
    /// Stable name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RecoveryStep::CaptureState => "capture_state",
            RecoveryStep::CloseConnections => "close_connections",
            RecoveryStep::CheckIntegrity => "check_integrity",
            RecoveryStep::Restore => "restore",
            RecoveryStep::Reinitialize => "reinitialize",
            RecoveryStep::Validate => "validate",
            RecoveryStep::EmitEvent => "emit_event",
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Step
    pub step: RecoveryStep,
    /// Whether it succeeded
    pub success: bool,
    /// Outcome detail
    pub detail: String,
}

/// One full pass of the recovery sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAttempt {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Steps executed, in order
    pub steps_executed: Vec<StepResult>,
    /// Whether every step succeeded
    pub success: bool,
}

impl RecoveryAttempt {
    /// Step at which the attempt stopped
    #[must_use]
    pub fn failed_step(&self) -> Option<RecoveryStep> {
        self.steps_executed.iter().find(|s| !s.success).map(|s| s.step)
    }
}

/// Outcome of a recovery run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Attempts in order
    pub attempts: Vec<RecoveryAttempt>,
    /// Whether some attempt completed
    pub success: bool,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
}

impl RecoveryReport {
    /// Error to surface when recovery was exhausted
    #[must_use]
    pub fn to_error(&self) -> Option<WardenError> {
        if self.success {
            return None;
        }
        let last = self
            .attempts
            .last()
            .and_then(RecoveryAttempt::failed_step)
            .map_or("unknown", RecoveryStep::as_str);
        Some(WardenError::EngineUnavailable(format!(
            "recovery exhausted after {} attempts (last failed at {last})",
            self.attempts.len()
        )))
    }
}

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    /// Probe succeeded
    pub healthy: bool,
    /// Probe latency
    pub latency: Duration,
    /// Probe error
    pub error: Option<String>,
    /// Failed probes in a row, including this one
    pub consecutive_failures: u32,
    /// Probe time
    pub checked_at: DateTime<Utc>,
}

enum Source {
    DataFile(PathBuf),
    InMemory,
    Unusable(String),
}

/// Health probing and bounded, retried engine recovery
pub struct CrashRecoveryManager {
    engine: EngineSlot,
    config: RecoveryConfig,
    engine_config: EngineConfig,
    max_attempts: u32,
    events: Arc<dyn EventSink>,
    maintenance: MaintenanceLock,
    running: tokio::sync::Mutex<()>,
    consecutive_failures: AtomicU32,
    history: Mutex<Vec<RecoveryReport>>,
}

impl CrashRecoveryManager {
    /// Manager restoring the configured engine settings
    #[must_use]
    pub fn new(config: &WardenConfig, engine: EngineSlot, events: Arc<dyn EventSink>) -> Self {
        let mut engine_config = EngineConfig::new(config.memory_limit_bytes, config.max_connections);
        engine_config.data_path = config.recovery.data_path.clone();
        Self {
            engine,
            config: config.recovery.clone(),
            engine_config,
            max_attempts: config.max_recovery_attempts.max(1),
            events,
            maintenance: MaintenanceLock::new(),
            running: tokio::sync::Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Share a maintenance lock
    #[inline]
    #[must_use]
    pub fn with_maintenance(mut self, maintenance: MaintenanceLock) -> Self {
        self.maintenance = maintenance;
        self
    }

    /// Failed probes in a row
    #[inline]
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Past recovery runs, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<RecoveryReport> {
        self.history.lock().clone()
    }

    /// Probe the engine once
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let engine = self.engine.current();
        let outcome =
            tokio::time::timeout(self.config.health_check_timeout(), engine.execute(PROBE_QUERY)).await;
        let latency = started.elapsed();

        let error = match outcome {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "health probe timed out after {}ms",
                self.config.health_check_timeout_ms
            )),
        };
        let consecutive_failures = if error.is_none() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        };
        if let Some(e) = &error {
            tracing::warn!(error = %e, consecutive_failures, "engine health probe failed");
        }
        HealthStatus {
            healthy: error.is_none(),
            latency,
            error,
            consecutive_failures,
            checked_at: Utc::now(),
        }
    }

    /// Probe, and recover when the probe fails
    pub async fn check_and_recover(&self) -> Option<RecoveryReport> {
        if self.health_check().await.healthy {
            return None;
        }
        Some(self.recover().await)
    }

    /// Run the recovery sequence
    pub async fn recover(&self) -> RecoveryReport {
        let _single = self.running.lock().await;
        let _exclusive = self.maintenance.exclusive().await;
        let started_at = Utc::now();
        let mut attempts = Vec::with_capacity(self.max_attempts as usize);

        for number in 1..=self.max_attempts {
            let span = tracing::info_span!("recovery_attempt", attempt = number);
            let attempt = self.attempt(number).instrument(span).await;
            self.events.audit(
                AuditOperation::RecoveryAttempt,
                AuditOutcome::from_success(attempt.success),
                json!({
                    "attempt": number,
                    "success": attempt.success,
                    "steps": &attempt.steps_executed,
                }),
            );
            let success = attempt.success;
            attempts.push(attempt);
            if success {
                break;
            }
            if number < self.max_attempts {
                let backoff = self.config.backoff_after(number);
                tracing::info!(attempt = number, backoff_ms = backoff.as_millis() as u64, "recovery attempt failed, backing off");
                tokio::time::sleep(backoff).await;
            }
        }

        let report = RecoveryReport {
            success: attempts.last().is_some_and(|a| a.success),
            attempts,
            started_at,
            finished_at: Utc::now(),
        };
        if report.success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.emit_failed(&report);
        }

        let mut history = self.history.lock();
        history.push(report.clone());
        if history.len() > HISTORY_LIMIT {
            history.remove(0);
        }
        report
    }

    async fn attempt(&self, number: u32) -> RecoveryAttempt {
        let mut steps = Vec::with_capacity(7);
        let engine = self.engine.current();

        // 1. Snapshot of the configuration the engine is restored with.
        let mut snapshot = self.engine_config.clone();
        steps.push(ok(
            RecoveryStep::CaptureState,
            format!(
                "memory_limit={} max_connections={}",
                snapshot.memory_limit_bytes, snapshot.max_connections
            ),
        ));

        // 2. Best-effort close.
        let detail = match engine.close().await {
            Ok(()) => "connections closed".to_string(),
            Err(e) => format!("close failed, continuing: {e}"),
        };
        steps.push(ok(RecoveryStep::CloseConnections, detail));

        // 3. Integrity of the data file.
        let source = match &snapshot.data_path {
            None => Source::InMemory,
            Some(path) => match check_data_file(path).await {
                Ok(()) => Source::DataFile(path.clone()),
                Err(reason) => Source::Unusable(reason),
            },
        };
        steps.push(ok(
            RecoveryStep::CheckIntegrity,
            match &source {
                Source::DataFile(p) => format!("data file {} intact", p.display()),
                Source::InMemory => "in-memory engine: not recoverable".to_string(),
                Source::Unusable(reason) => format!("data file not recoverable: {reason}"),
            },
        ));

        // 4. Restore source.
        match source {
            Source::DataFile(path) => {
                steps.push(ok(RecoveryStep::Restore, format!("reopening {}", path.display())));
            }
            Source::InMemory | Source::Unusable(_) => match self.latest_backup().await {
                Some(backup) => {
                    steps.push(ok(RecoveryStep::Restore, format!("restoring from {}", backup.display())));
                    snapshot.restore_from = Some(backup);
                }
                None => {
                    steps.push(fail(RecoveryStep::Restore, "no data file or backup available"));
                    return finish(number, steps);
                }
            },
        }

        // 5. Reinitialize.
        if let Err(e) = engine.reinitialize(&snapshot).await {
            steps.push(fail(RecoveryStep::Reinitialize, e.to_string()));
            return finish(number, steps);
        }
        steps.push(ok(RecoveryStep::Reinitialize, "engine reinitialized"));

        // 6. Validate.
        let validated = match engine.execute(PROBE_QUERY).await {
            Ok(_) => engine.list_tables().await.map(|t| t.len()),
            Err(e) => Err(e),
        };
        match validated {
            Ok(tables) => steps.push(ok(RecoveryStep::Validate, format!("{tables} tables visible"))),
            Err(e) => {
                steps.push(fail(RecoveryStep::Validate, e.to_string()));
                return finish(number, steps);
            }
        }

        // 7. Completion event.
        self.events.audit(
            AuditOperation::RecoveryCompleted,
            AuditOutcome::Success,
            json!({ "attempt": number }),
        );
        self.events.notify(
            Notification::new(
                Severity::Warning,
                "Engine recovered",
                format!("engine recovered on attempt {number}"),
            )
            .with_context("attempt", number),
        );
        steps.push(ok(RecoveryStep::EmitEvent, "recovery completed"));
        tracing::info!(attempt = number, "engine recovery completed");
        finish(number, steps)
    }

    fn emit_failed(&self, report: &RecoveryReport) {
        let failed_at: Vec<&str> = report
            .attempts
            .iter()
            .filter_map(RecoveryAttempt::failed_step)
            .map(RecoveryStep::as_str)
            .collect();
        tracing::error!(attempts = report.attempts.len(), ?failed_at, "engine recovery exhausted");
        self.events.audit(
            AuditOperation::RecoveryCompleted,
            AuditOutcome::Failure,
            json!({ "attempts": report.attempts.len(), "failedAt": failed_at }),
        );
        self.events.notify(
            Notification::new(
                Severity::Critical,
                "Engine recovery failed",
                format!("recovery failed after {} attempts", report.attempts.len()),
            )
            .with_action("Check the data file and backups; cloud fallback may take over"),
        );
    }

    /// Most recently modified backup artifact, if any
    pub async fn latest_backup(&self) -> Option<PathBuf> {
        let dir = self.config.backup_dir.as_ref()?;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "backup directory unreadable");
                return None;
            }
        };
        let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.config.backup_extension.as_str()) {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if best.as_ref().map_or(true, |(t, _)| modified > *t) {
                best = Some((modified, path));
            }
        }
        best.map(|(_, path)| path)
    }
}

impl std::fmt::Debug for CrashRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashRecoveryManager")
            .field("max_attempts", &self.max_attempts)
            .field("consecutive_failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

async fn check_data_file(path: &Path) -> Result<(), String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("{} missing: {e}", path.display()))?;
    if !meta.is_file() {
        return Err(format!("{} is not a file", path.display()));
    }
    if meta.len() == 0 {
        return Err(format!("{} is empty", path.display()));
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("{} unreadable: {e}", path.display()))?;
    Ok(())
}

fn ok(step: RecoveryStep, detail: impl Into<String>) -> StepResult {
    StepResult {
        step,
        success: true,
        detail: detail.into(),
    }
}

fn fail(step: RecoveryStep, detail: impl Into<String>) -> StepResult {
    let detail = detail.into();
    tracing::warn!(step = step.as_str(), detail = %detail, "recovery step failed");
    StepResult {
        step,
        success: false,
        detail,
    }
}

fn finish(attempt_number: u32, steps_executed: Vec<StepResult>) -> RecoveryAttempt {
    let success = steps_executed.len() == 7 && steps_executed.iter().all(|s| s.success);
    RecoveryAttempt {
        attempt_number,
        steps_executed,
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_test_utils::{capture_events, test_config, EngineCall, FakeEngine};

    fn manager(config: &WardenConfig, engine: &Arc<FakeEngine>) -> CrashRecoveryManager {
        let (events, _) = capture_events();
        CrashRecoveryManager::new(config, EngineSlot::new(engine.clone()), events)
    }

    #[tokio::test]
    async fn healthy_engine_needs_no_recovery() {
        let engine = Arc::new(FakeEngine::new());
        let m = manager(&test_config(), &engine);
        assert!(m.check_and_recover().await.is_none());
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_available(false);
        let m = manager(&test_config(), &engine);
        for expected in 1..=3 {
            let status = m.health_check().await;
            assert!(!status.healthy);
            assert_eq!(status.consecutive_failures, expected);
        }
    }

    #[tokio::test]
    async fn recovers_from_intact_data_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("warehouse.db");
        std::fs::write(&data, b"pages").unwrap();
        let mut config = test_config();
        config.recovery.data_path = Some(data.clone());

        let engine = Arc::new(FakeEngine::new().with_table("orders", 5));
        engine.set_available(false);
        let m = manager(&config, &engine);

        let report = m.check_and_recover().await.unwrap();
        assert!(report.success);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].steps_executed.len(), 7);

        let reinit = engine
            .calls()
            .into_iter()
            .find_map(|c| match c {
                EngineCall::Reinitialize(cfg) => Some(cfg),
                _ => None,
            })
            .unwrap();
        assert_eq!(reinit.data_path, Some(data));
        assert_eq!(reinit.restore_from, None);
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn in_memory_engine_restores_latest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("a.backup");
        std::fs::write(&old, b"old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let new = dir.path().join("b.backup");
        std::fs::write(&new, b"new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut config = test_config();
        config.recovery.backup_dir = Some(dir.path().to_path_buf());
        let engine = Arc::new(FakeEngine::new());
        let m = manager(&config, &engine);

        let report = m.recover().await;
        assert!(report.success);
        let restore = &report.attempts[0].steps_executed[3];
        assert_eq!(restore.step, RecoveryStep::Restore);
        assert!(restore.detail.contains("b.backup"));
        assert_eq!(m.history().len(), 1);
    }

    #[tokio::test]
    async fn reinitialize_failure_fails_attempt_at_step_five() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("warehouse.db");
        std::fs::write(&data, b"pages").unwrap();
        let mut config = test_config();
        config.recovery.data_path = Some(data);
        config.max_recovery_attempts = 2;

        let engine = Arc::new(FakeEngine::new());
        engine.set_reinit_ok(false);
        let m = manager(&config, &engine);

        let report = m.recover().await;
        assert!(!report.success);
        assert_eq!(report.attempts.len(), 2);
        assert_eq!(report.attempts[1].failed_step(), Some(RecoveryStep::Reinitialize));
        assert!(matches!(report.to_error(), Some(WardenError::EngineUnavailable(_))));
    }

    #[tokio::test]
    async fn empty_data_file_is_not_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("warehouse.db");
        std::fs::write(&data, b"").unwrap();
        let mut config = test_config();
        config.recovery.data_path = Some(data);
        config.max_recovery_attempts = 1;

        let engine = Arc::new(FakeEngine::new());
        let m = manager(&config, &engine);
        let report = m.recover().await;

        let steps = &report.attempts[0].steps_executed;
        assert!(steps[2].detail.contains("is empty"));
        assert_eq!(report.attempts[0].failed_step(), Some(RecoveryStep::Restore));
    }
}
