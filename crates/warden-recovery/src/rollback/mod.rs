//! Operation rollback
//!
//! Wraps a multi-step mutation with a checkpoint and a step journal:
//! - [`OperationRollbackManager::begin`] counts rows of the affected tables
//!   and persists the checkpoint as JSON when a backing store is configured
//! - [`OperationRollbackManager::record_step`] appends to the journal
//! - [`OperationRollbackManager::complete`] consumes the checkpoint
//! - [`OperationRollbackManager::rollback`] runs compensators newest first,
//!   keeps going past failures, and compares row counts to the checkpoint
//!
//! Compensators are looked up by step name. The four built-in ones are
//! registered by default; more can be added with
//! [`OperationRollbackManager::register_compensator`].

mod compensators;

pub use compensators::{
    Compensator, DeleteInsertedRows, DropCreatedTable, ReinsertDeletedRows, RestoreUpdatedValues,
};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Instrument;
use ulid::Ulid;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::sql::quote_ident;
use warden_core::{
    EngineAdapter, EngineSlot, EventSink, Notification, OperationId, Severity, WardenError,
    WardenResult,
};

/// Lifecycle of an operation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Steps are still being recorded
    InProgress,
    /// Finished normally
    Completed,
    /// Compensated
    RolledBack,
}

/// Pre-operation snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Checkpoint id
    pub id: String,
    /// Owning operation
    pub operation_id: OperationId,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Row count per table at capture time
    pub table_row_counts: BTreeMap<String, u64>,
    /// Where the checkpoint is persisted, if anywhere
    pub backing_store_path: Option<PathBuf>,
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step type, used to pick the compensator
    pub name: String,
    /// Whatever the compensator needs
    pub data: Value,
    /// When the step was recorded
    pub timestamp: DateTime<Utc>,
}

/// Journal of one multi-step operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Operation id
    pub id: OperationId,
    /// Caller-defined operation type
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Caller metadata
    pub metadata: Value,
    /// Steps in recording order
    pub steps: Vec<StepRecord>,
    /// Lifecycle state
    pub status: OperationStatus,
    /// Checkpoint owned by this record
    pub checkpoint_ref: String,
    /// Result passed to `complete`
    pub result: Option<Value>,
}

/// Outcome of one compensator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationOutcome {
    /// Position in the journal
    pub index: usize,
    /// Step type
    pub step: String,
    /// Whether the compensator succeeded
    pub success: bool,
    /// What happened
    pub detail: String,
}

/// Row count that differs from the checkpoint after rollback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDrift {
    /// Table
    pub table: String,
    /// Count at checkpoint
    pub expected: u64,
    /// Count now; absent when the table is gone
    pub actual: Option<u64>,
}

/// Aggregate rollback outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackResult {
    /// Operation rolled back
    pub operation_id: OperationId,
    /// Why
    pub reason: String,
    /// Every compensator run, newest step first
    pub compensations: Vec<CompensationOutcome>,
    /// Steps whose compensator failed or was missing
    pub unresolved: Vec<String>,
    /// Tables whose row counts differ from the checkpoint
    pub drift: Vec<TableDrift>,
    /// No unresolved steps and no drift
    pub success: bool,
}

impl RollbackResult {
    /// Validation error when something was left behind
    #[must_use]
    pub fn to_error(&self) -> Option<WardenError> {
        if self.success {
            return None;
        }
        let mut problems: Vec<String> = self
            .unresolved
            .iter()
            .map(|s| format!("unresolved step {s}"))
            .collect();
        problems.extend(self.drift.iter().map(|d| match d.actual {
            Some(actual) => format!("{} has {actual} rows, expected {}", d.table, d.expected),
            None => format!("{} is missing, expected {} rows", d.table, d.expected),
        }));
        Some(WardenError::RollbackValidationFailed(problems))
    }
}

/// Checkpointed multi-step operations with reverse-order compensation
pub struct OperationRollbackManager {
    engine: EngineSlot,
    events: Arc<dyn EventSink>,
    store_dir: Option<PathBuf>,
    records: DashMap<OperationId, OperationRecord>,
    checkpoints: DashMap<String, Checkpoint>,
    compensators: RwLock<HashMap<String, Arc<dyn Compensator>>>,
}

impl OperationRollbackManager {
    /// Manager with the built-in compensators and no backing store
    #[must_use]
    pub fn new(engine: EngineSlot, events: Arc<dyn EventSink>) -> Self {
        let mut compensators: HashMap<String, Arc<dyn Compensator>> = HashMap::new();
        compensators.insert("create_table".into(), Arc::new(DropCreatedTable));
        compensators.insert("insert_data".into(), Arc::new(DeleteInsertedRows));
        compensators.insert("update_data".into(), Arc::new(RestoreUpdatedValues));
        compensators.insert("delete_data".into(), Arc::new(ReinsertDeletedRows));
        Self {
            engine,
            events,
            store_dir: None,
            records: DashMap::new(),
            checkpoints: DashMap::new(),
            compensators: RwLock::new(compensators),
        }
    }

    /// Persist checkpoints under `dir`
    #[inline]
    #[must_use]
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Add or replace the compensator for a step type
    pub fn register_compensator(&self, step_type: impl Into<String>, compensator: Arc<dyn Compensator>) {
        self.compensators.write().insert(step_type.into(), compensator);
    }

    /// Snapshot of a record
    #[must_use]
    pub fn record(&self, id: &OperationId) -> Option<OperationRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Checkpoint still held for an operation
    #[must_use]
    pub fn checkpoint_for(&self, id: &OperationId) -> Option<Checkpoint> {
        let checkpoint_ref = self.records.get(id)?.checkpoint_ref.clone();
        self.checkpoints.get(&checkpoint_ref).map(|c| c.clone())
    }

    /// Operations still in progress
    #[must_use]
    pub fn in_progress(&self) -> Vec<OperationId> {
        self.records
            .iter()
            .filter(|r| r.status == OperationStatus::InProgress)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Start an operation and take its checkpoint.
    ///
    /// `metadata.tables` (array of names) limits the snapshot; without it
    /// every non-temporary table is counted.
    pub async fn begin(
        &self,
        id: OperationId,
        operation_type: impl Into<String>,
        metadata: Value,
    ) -> WardenResult<Checkpoint> {
        if self.is_in_progress(&id) {
            return Err(WardenError::OperationAlreadyActive(id));
        }
        let engine = self.engine.current();
        let tables: Vec<String> = match metadata.get("tables").and_then(Value::as_array) {
            Some(names) => names.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            None => engine
                .list_tables()
                .await?
                .into_iter()
                .filter(|t| !t.temporary)
                .map(|t| t.name)
                .collect(),
        };

        let mut checkpoint = Checkpoint {
            id: format!("cp-{}", Ulid::new()),
            operation_id: id.clone(),
            timestamp: Utc::now(),
            table_row_counts: count_rows(engine.as_ref(), &tables).await,
            backing_store_path: None,
        };
        if let Some(dir) = &self.store_dir {
            checkpoint.backing_store_path = Some(persist(dir, &checkpoint).await?);
        }

        let record = OperationRecord {
            id: id.clone(),
            operation_type: operation_type.into(),
            metadata,
            steps: Vec::new(),
            status: OperationStatus::InProgress,
            checkpoint_ref: checkpoint.id.clone(),
            result: None,
        };
        let inserted = match self.records.entry(id.clone()) {
            Entry::Occupied(e) if e.get().status == OperationStatus::InProgress => false,
            Entry::Occupied(mut e) => {
                e.insert(record);
                true
            }
            Entry::Vacant(e) => {
                e.insert(record);
                true
            }
        };
        if !inserted {
            discard(&checkpoint).await;
            return Err(WardenError::OperationAlreadyActive(id));
        }
        self.checkpoints.insert(checkpoint.id.clone(), checkpoint.clone());
        tracing::debug!(operation_id = %id, checkpoint = %checkpoint.id, tables = checkpoint.table_row_counts.len(), "checkpoint taken");
        Ok(checkpoint)
    }

    fn is_in_progress(&self, id: &OperationId) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.status == OperationStatus::InProgress)
    }

    /// Append a step to an in-progress operation
    pub fn record_step(&self, id: &OperationId, name: impl Into<String>, data: Value) -> WardenResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .filter(|r| r.status == OperationStatus::InProgress)
            .ok_or_else(|| WardenError::UnknownOperation(id.clone()))?;
        record.steps.push(StepRecord {
            name: name.into(),
            data,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Finish an operation and consume its checkpoint
    pub async fn complete(&self, id: &OperationId, result: Value) -> WardenResult<OperationRecord> {
        let (record, checkpoint_ref) = {
            let mut record = self
                .records
                .get_mut(id)
                .filter(|r| r.status == OperationStatus::InProgress)
                .ok_or_else(|| WardenError::UnknownOperation(id.clone()))?;
            record.status = OperationStatus::Completed;
            record.result = Some(result);
            (record.clone(), record.checkpoint_ref.clone())
        };
        if let Some((_, checkpoint)) = self.checkpoints.remove(&checkpoint_ref) {
            discard(&checkpoint).await;
        }
        Ok(record)
    }

    /// Compensate every recorded step, newest first
    pub async fn rollback(&self, id: &OperationId, reason: &str) -> WardenResult<RollbackResult> {
        let record = self
            .record(id)
            .filter(|r| r.status == OperationStatus::InProgress)
            .ok_or_else(|| WardenError::UnknownOperation(id.clone()))?;
        let checkpoint = self
            .checkpoints
            .get(&record.checkpoint_ref)
            .map(|c| c.clone())
            .ok_or_else(|| WardenError::UnknownOperation(id.clone()))?;

        let span = tracing::info_span!("operation_rollback", operation_id = %id, steps = record.steps.len());
        let result = self.compensate_all(&record, &checkpoint, reason).instrument(span).await;

        if let Some(mut r) = self.records.get_mut(id) {
            r.status = OperationStatus::RolledBack;
        }
        if result.success {
            if let Some((_, checkpoint)) = self.checkpoints.remove(&record.checkpoint_ref) {
                discard(&checkpoint).await;
            }
        }
        self.emit(&record, &result);
        Ok(result)
    }

    async fn compensate_all(
        &self,
        record: &OperationRecord,
        checkpoint: &Checkpoint,
        reason: &str,
    ) -> RollbackResult {
        tracing::warn!(reason, "rolling back operation");
        let engine = self.engine.current();
        let mut compensations = Vec::with_capacity(record.steps.len());
        let mut unresolved = Vec::new();

        for (index, step) in record.steps.iter().enumerate().rev() {
            let compensator = self.compensators.read().get(&step.name).cloned();
            let outcome = match compensator {
                Some(c) => c.compensate(engine.as_ref(), step, checkpoint).await,
                None => Err(WardenError::RollbackStepFailed {
                    step: step.name.clone(),
                    reason: "no compensator registered".into(),
                }),
            };
            let (success, detail) = match outcome {
                Ok(detail) => (true, detail),
                Err(e) => {
                    tracing::warn!(index, step = %step.name, error = %e, "compensator failed, continuing");
                    unresolved.push(format!("{index}:{}", step.name));
                    (false, e.to_string())
                }
            };
            compensations.push(CompensationOutcome {
                index,
                step: step.name.clone(),
                success,
                detail,
            });
        }

        let drift = self.drift(engine.as_ref(), checkpoint).await;
        RollbackResult {
            operation_id: record.id.clone(),
            reason: reason.to_string(),
            success: unresolved.is_empty() && drift.is_empty(),
            compensations,
            unresolved,
            drift,
        }
    }

    async fn drift(&self, engine: &dyn EngineAdapter, checkpoint: &Checkpoint) -> Vec<TableDrift> {
        let tables: Vec<String> = checkpoint.table_row_counts.keys().cloned().collect();
        let now = count_rows(engine, &tables).await;
        checkpoint
            .table_row_counts
            .iter()
            .filter_map(|(table, &expected)| {
                let actual = now.get(table).copied();
                (actual != Some(expected)).then(|| TableDrift {
                    table: table.clone(),
                    expected,
                    actual,
                })
            })
            .collect()
    }

    fn emit(&self, record: &OperationRecord, result: &RollbackResult) {
        let resolved = result.compensations.iter().filter(|c| c.success).count();
        let outcome = if result.success {
            AuditOutcome::Success
        } else if resolved > 0 {
            AuditOutcome::Partial
        } else {
            AuditOutcome::Failure
        };
        self.events.audit(
            AuditOperation::OperationRollback,
            outcome,
            json!({
                "operationId": record.id,
                "type": record.operation_type,
                "reason": result.reason,
                "steps": record.steps.len(),
                "unresolved": result.unresolved,
                "drift": result.drift,
            }),
        );
        let notification = if result.success {
            Notification::new(
                Severity::Warning,
                "Operation rolled back",
                format!("{} ({}) rolled back: {}", record.id, record.operation_type, result.reason),
            )
        } else {
            Notification::new(
                Severity::Critical,
                "Operation rollback incomplete",
                format!(
                    "{} left {} unresolved steps and {} drifting tables",
                    record.id,
                    result.unresolved.len(),
                    result.drift.len()
                ),
            )
            .with_action("Inspect the checkpoint and compensate manually")
        };
        self.events.notify(notification.with_context("operationId", record.id.to_string()));
    }
}

impl std::fmt::Debug for OperationRollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRollbackManager")
            .field("store_dir", &self.store_dir)
            .field("records", &self.records.len())
            .field("checkpoints", &self.checkpoints.len())
            .finish_non_exhaustive()
    }
}

async fn count_rows(engine: &dyn EngineAdapter, tables: &[String]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for table in tables {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        match engine.execute(&query).await {
            Ok(result) => {
                if let Some(n) = result.first_u64() {
                    counts.insert(table.clone(), n);
                }
            }
            Err(e) => tracing::debug!(table = %table, error = %e, "row count unavailable"),
        }
    }
    counts
}

async fn persist(dir: &Path, checkpoint: &Checkpoint) -> WardenResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.json", checkpoint.id));
    let mut stored = checkpoint.clone();
    stored.backing_store_path = Some(path.clone());
    tokio::fs::write(&path, serde_json::to_vec_pretty(&stored)?).await?;
    Ok(path)
}

async fn discard(checkpoint: &Checkpoint) {
    let Some(path) = &checkpoint.backing_store_path else {
        return;
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "cannot delete checkpoint file");
        }
    }
}
