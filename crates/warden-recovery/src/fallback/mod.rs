//! Cloud fallback
//!
//! Moves query execution off the local engine when local remediation is
//! exhausted. Activation pauses admission, drains in-flight work under a
//! bounded wait, exports durable tables, connects the configured provider
//! and swaps a [`TranslatingAdapter`] into the shared [`EngineSlot`].
//!
//! At most one [`FallbackSession`] exists. The session mutex is held for
//! the whole activation, so a concurrent request waits and then receives
//! the session the first request created. A failed activation latches:
//! no further automatic attempt is made until [`CloudFallbackManager::reset_failure`].

mod translate;
mod trigger;

pub use translate::{translate, TranslatingAdapter, Translation};
pub use trigger::{FallbackReason, FallbackTrigger, OperationStats, TriggerInputs};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::sql::{quote_ident, quote_str};
use warden_core::{
    ActiveOperationSource, Admission, CloudFallbackConfig, EngineAdapter, EngineError,
    EngineSlot, EventSink, FallbackProvider, Notification, Severity, WardenError, WardenResult,
};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Opens connections to the alternate backend
#[async_trait::async_trait]
pub trait BackendConnector: Send + Sync {
    /// Connect to `provider` with opaque credentials
    async fn connect(
        &self,
        provider: &FallbackProvider,
        credentials: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn EngineAdapter>, EngineError>;
}

/// A table that could not be exported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportFailure {
    /// Table name
    pub table: String,
    /// Why
    pub error: String,
}

/// Active redirection to the alternate backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackSession {
    /// Session id
    pub id: Uuid,
    /// Provider in use
    pub provider: FallbackProvider,
    /// Whether operations are currently routed remotely
    pub active: bool,
    /// What triggered activation
    pub reason: FallbackReason,
    /// Activation time
    pub activated_at: DateTime<Utc>,
    /// Files written by the export step
    pub exported_tables: Vec<PathBuf>,
    /// Tables the export step could not write
    pub export_failures: Vec<ExportFailure>,
    /// Whether the drain finished before its timeout
    pub drained: bool,
}

/// Outcome of deactivation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeactivationReport {
    /// The session that ended
    pub session: FallbackSession,
    /// Tables re-imported into the local engine
    pub reimported: Vec<String>,
    /// Re-import failures
    pub reimport_failures: Vec<ExportFailure>,
}

/// Singleton fallback session manager
pub struct CloudFallbackManager {
    config: CloudFallbackConfig,
    engine: EngineSlot,
    connector: Arc<dyn BackendConnector>,
    admission: Arc<Admission>,
    operations: RwLock<Option<Arc<dyn ActiveOperationSource>>>,
    events: Arc<dyn EventSink>,
    session: tokio::sync::Mutex<Option<FallbackSession>>,
    local: Mutex<Option<Arc<dyn EngineAdapter>>>,
    remote: Mutex<Option<Arc<dyn EngineAdapter>>>,
    failed: AtomicBool,
    active: AtomicBool,
}

impl CloudFallbackManager {
    /// Manager for the configured provider
    #[must_use]
    pub fn new(
        config: &CloudFallbackConfig,
        engine: EngineSlot,
        connector: Arc<dyn BackendConnector>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config: config.clone(),
            engine,
            connector,
            admission: Arc::new(Admission::new()),
            operations: RwLock::new(None),
            events,
            session: tokio::sync::Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            failed: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    /// Share an admission gate
    #[inline]
    #[must_use]
    pub fn with_admission(mut self, admission: Arc<Admission>) -> Self {
        self.admission = admission;
        self
    }

    /// Attach the in-flight count used by the drain step
    pub fn set_operation_source(&self, source: Arc<dyn ActiveOperationSource>) {
        *self.operations.write() = Some(source);
    }

    /// Whether a session is routing operations
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether a previous activation failed and is latched
    #[inline]
    #[must_use]
    pub fn activation_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Clear the failure latch after operator intervention
    pub fn reset_failure(&self) {
        self.failed.store(false, Ordering::Release);
    }

    /// Current session, if any
    pub async fn session(&self) -> Option<FallbackSession> {
        self.session.lock().await.clone()
    }

    /// Activate, or return the session already active
    pub async fn activate(&self, reason: FallbackReason) -> WardenResult<FallbackSession> {
        let mut slot = self.session.lock().await;
        if let Some(existing) = slot.as_ref().filter(|s| s.active) {
            tracing::debug!(session = %existing.id, "fallback already active");
            return Ok(existing.clone());
        }
        if !self.config.enabled() {
            return Err(WardenError::FallbackActivationFailed(
                "no fallback provider configured".into(),
            ));
        }
        if self.activation_failed() {
            return Err(WardenError::FallbackActivationFailed(
                "previous activation failed; operator reset required".into(),
            ));
        }

        let id = Uuid::new_v4();
        let span = tracing::info_span!("fallback_activation", session = %id, provider = %self.config.provider);
        let session = self.run_activation(id, reason).instrument(span).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn run_activation(&self, id: Uuid, reason: FallbackReason) -> WardenResult<FallbackSession> {
        tracing::warn!(reason = %reason, "activating cloud fallback");

        // 1. Stop admitting new work locally.
        self.admission.set_paused(true);

        // 2. Bounded drain.
        let drained = self.drain().await;

        // 3. Best-effort export.
        let local = self.engine.current();
        let (exported_tables, export_failures) = self.export_tables(local.as_ref()).await;

        // 4. Connect.
        let remote = match self
            .connector
            .connect(&self.config.provider, &self.config.credentials)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                self.admission.set_paused(false);
                let err = WardenError::FallbackActivationFailed(format!(
                    "cannot connect to {}: {e}",
                    self.config.provider
                ));
                tracing::error!(error = %err, "fallback activation failed");
                self.events.audit(
                    AuditOperation::FallbackActivated,
                    AuditOutcome::Failure,
                    json!({
                        "session": id,
                        "provider": self.config.provider,
                        "reason": &reason,
                        "error": err.to_string(),
                    }),
                );
                self.events.notify(
                    Notification::new(err.severity(), "Cloud fallback failed", err.to_string())
                        .with_action("Local engine stays in service; inspect provider credentials"),
                );
                return Err(err);
            }
        };

        // 5. Route through the translating adapter.
        let adapter: Arc<dyn EngineAdapter> =
            Arc::new(TranslatingAdapter::new(remote.clone(), self.config.provider.clone()));
        let previous = self.engine.swap(adapter);
        *self.local.lock() = Some(previous);
        *self.remote.lock() = Some(remote);
        self.active.store(true, Ordering::Release);
        self.admission.set_paused(false);

        let session = FallbackSession {
            id,
            provider: self.config.provider.clone(),
            active: true,
            reason,
            activated_at: Utc::now(),
            exported_tables,
            export_failures,
            drained,
        };
        let outcome = if session.export_failures.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Partial
        };
        self.events.audit(AuditOperation::FallbackActivated, outcome, json!(&session));
        self.events.notify(
            Notification::new(
                Severity::Critical,
                "Cloud fallback active",
                format!("operations now run on {}: {}", session.provider, session.reason),
            )
            .with_context("session", session.id.to_string())
            .with_context("exported", session.exported_tables.len()),
        );
        tracing::info!(
            exported = session.exported_tables.len(),
            export_failures = session.export_failures.len(),
            "cloud fallback active"
        );
        Ok(session)
    }

    async fn drain(&self) -> bool {
        let Some(source) = self.operations.read().clone() else {
            return true;
        };
        let wait = async {
            while source.active_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        match tokio::time::timeout(self.config.drain_timeout(), wait).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = source.active_count(),
                    timeout_ms = self.config.drain_timeout_ms,
                    "drain timed out, continuing"
                );
                false
            }
        }
    }

    async fn export_tables(&self, engine: &dyn EngineAdapter) -> (Vec<PathBuf>, Vec<ExportFailure>) {
        let mut exported = Vec::new();
        let mut failures = Vec::new();

        let tables = match engine.list_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list tables for export");
                failures.push(ExportFailure {
                    table: "*".into(),
                    error: e.to_string(),
                });
                return (exported, failures);
            }
        };
        let dir_ready = tokio::fs::create_dir_all(&self.config.export_dir).await;

        for table in tables.into_iter().filter(|t| !t.temporary) {
            if let Err(e) = &dir_ready {
                failures.push(ExportFailure {
                    table: table.name,
                    error: format!("export directory unavailable: {e}"),
                });
                continue;
            }
            let path = export_path(&self.config.export_dir, &table.name);
            let statement = format!(
                "COPY {} TO {} (FORMAT PARQUET)",
                quote_ident(&table.name),
                quote_str(&path.display().to_string())
            );
            match engine.execute(&statement).await {
                Ok(_) => exported.push(path),
                Err(e) => {
                    tracing::warn!(table = %table.name, error = %e, "table export failed");
                    failures.push(ExportFailure {
                        table: table.name,
                        error: e.to_string(),
                    });
                }
            }
        }
        (exported, failures)
    }

    /// Restore the local engine and end the session
    pub async fn deactivate(&self, reimport: bool) -> WardenResult<Option<DeactivationReport>> {
        let mut slot = self.session.lock().await;
        let Some(mut session) = slot.take().filter(|s| s.active) else {
            return Ok(None);
        };

        let local = self.local.lock().take();
        let Some(local) = local else {
            *slot = Some(session);
            return Err(WardenError::EngineUnavailable(
                "no local engine handle to restore".into(),
            ));
        };
        self.engine.swap(local.clone());
        self.active.store(false, Ordering::Release);
        let remote = self.remote.lock().take();
        if let Some(remote) = remote {
            if let Err(e) = remote.close().await {
                tracing::debug!(error = %e, "closing remote backend failed");
            }
        }

        let mut reimported = Vec::new();
        let mut reimport_failures = Vec::new();
        if reimport {
            for path in &session.exported_tables {
                let Some(table) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                let statement = format!(
                    "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_parquet({})",
                    quote_ident(&table),
                    quote_str(&path.display().to_string())
                );
                match local.execute(&statement).await {
                    Ok(_) => reimported.push(table),
                    Err(e) => {
                        tracing::warn!(table = %table, error = %e, "re-import failed");
                        reimport_failures.push(ExportFailure {
                            table,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        self.admission.set_paused(false);

        session.active = false;
        let report = DeactivationReport {
            session,
            reimported,
            reimport_failures,
        };
        let outcome = if report.reimport_failures.is_empty() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Partial
        };
        self.events.audit(
            AuditOperation::FallbackDeactivated,
            outcome,
            json!({
                "session": report.session.id,
                "provider": report.session.provider,
                "reimported": &report.reimported,
                "reimportFailures": &report.reimport_failures,
            }),
        );
        self.events.notify(Notification::new(
            Severity::Warning,
            "Cloud fallback ended",
            format!("operations routed back to the local engine ({} tables re-imported)", report.reimported.len()),
        ));
        tracing::info!(session = %report.session.id, "cloud fallback deactivated");
        Ok(Some(report))
    }
}

impl std::fmt::Debug for CloudFallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudFallbackManager")
            .field("provider", &self.config.provider)
            .field("active", &self.is_active())
            .field("failed", &self.activation_failed())
            .finish_non_exhaustive()
    }
}

fn export_path(dir: &Path, table: &str) -> PathBuf {
    let file: String = table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("{file}.parquet"))
}
