//! Built-in compensators
//!
//! | step type | inverse |
//! |---|---|
//! | `create_table` | drop the table |
//! | `insert_data` | delete the most recent `rows` rows |
//! | `update_data` | write back the recorded previous values |
//! | `delete_data` | re-insert the recorded rows |

use super::{Checkpoint, StepRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use warden_core::sql::{literal, quote_ident};
use warden_core::{EngineAdapter, WardenError, WardenResult};

/// Inverse action for one step type
#[async_trait::async_trait]
pub trait Compensator: Send + Sync {
    /// Undo `step`; returns a short description of what was done
    async fn compensate(
        &self,
        engine: &dyn EngineAdapter,
        step: &StepRecord,
        checkpoint: &Checkpoint,
    ) -> WardenResult<String>;
}

fn step_data<T: DeserializeOwned>(step: &StepRecord) -> WardenResult<T> {
    serde_json::from_value(step.data.clone()).map_err(|e| WardenError::RollbackStepFailed {
        step: step.name.clone(),
        reason: format!("malformed step data: {e}"),
    })
}

async fn run(engine: &dyn EngineAdapter, step: &StepRecord, statement: &str) -> WardenResult<u64> {
    engine
        .execute(statement)
        .await
        .map(|r| r.rows_affected)
        .map_err(|e| WardenError::RollbackStepFailed {
            step: step.name.clone(),
            reason: e.to_string(),
        })
}

#[derive(Deserialize)]
struct TableStep {
    table: String,
}

/// `create_table` → `DROP TABLE IF EXISTS`
#[derive(Debug, Default)]
pub struct DropCreatedTable;

#[async_trait::async_trait]
impl Compensator for DropCreatedTable {
    async fn compensate(
        &self,
        engine: &dyn EngineAdapter,
        step: &StepRecord,
        _checkpoint: &Checkpoint,
    ) -> WardenResult<String> {
        let data: TableStep = step_data(step)?;
        run(engine, step, &format!("DROP TABLE IF EXISTS {}", quote_ident(&data.table))).await?;
        Ok(format!("dropped {}", data.table))
    }
}

#[derive(Deserialize)]
struct InsertStep {
    table: String,
    rows: u64,
}

/// `insert_data` → delete the newest `rows` rows
#[derive(Debug, Default)]
pub struct DeleteInsertedRows;

#[async_trait::async_trait]
impl Compensator for DeleteInsertedRows {
    async fn compensate(
        &self,
        engine: &dyn EngineAdapter,
        step: &StepRecord,
        _checkpoint: &Checkpoint,
    ) -> WardenResult<String> {
        let data: InsertStep = step_data(step)?;
        if data.rows == 0 {
            return Ok("nothing inserted".into());
        }
        let table = quote_ident(&data.table);
        let deleted = run(
            engine,
            step,
            &format!(
                "DELETE FROM {table} WHERE rowid IN (SELECT rowid FROM {table} ORDER BY rowid DESC LIMIT {})",
                data.rows
            ),
        )
        .await?;
        Ok(format!("deleted {deleted} of {} rows from {}", data.rows, data.table))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStep {
    table: String,
    #[serde(default)]
    previous_values: Map<String, Value>,
    #[serde(rename = "where")]
    predicate: String,
}

/// `update_data` → restore the recorded previous values
#[derive(Debug, Default)]
pub struct RestoreUpdatedValues;

#[async_trait::async_trait]
impl Compensator for RestoreUpdatedValues {
    async fn compensate(
        &self,
        engine: &dyn EngineAdapter,
        step: &StepRecord,
        _checkpoint: &Checkpoint,
    ) -> WardenResult<String> {
        let data: UpdateStep = step_data(step)?;
        if data.previous_values.is_empty() {
            return Err(WardenError::RollbackStepFailed {
                step: step.name.clone(),
                reason: "no previous values recorded".into(),
            });
        }
        let assignments = data
            .previous_values
            .iter()
            .map(|(column, value)| format!("{} = {}", quote_ident(column), literal(value)))
            .collect::<Vec<_>>()
            .join(", ");
        let restored = run(
            engine,
            step,
            &format!(
                "UPDATE {} SET {assignments} WHERE {}",
                quote_ident(&data.table),
                data.predicate
            ),
        )
        .await?;
        Ok(format!("restored {restored} rows in {}", data.table))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteStep {
    table: String,
    #[serde(default)]
    deleted_rows: Vec<Map<String, Value>>,
}

/// `delete_data` → re-insert the recorded rows
#[derive(Debug, Default)]
pub struct ReinsertDeletedRows;

#[async_trait::async_trait]
impl Compensator for ReinsertDeletedRows {
    async fn compensate(
        &self,
        engine: &dyn EngineAdapter,
        step: &StepRecord,
        _checkpoint: &Checkpoint,
    ) -> WardenResult<String> {
        let data: DeleteStep = step_data(step)?;
        let Some(first) = data.deleted_rows.first() else {
            return Err(WardenError::RollbackStepFailed {
                step: step.name.clone(),
                reason: "deleted rows were not captured".into(),
            });
        };
        let columns: Vec<&String> = first.keys().collect();
        let tuples = data
            .deleted_rows
            .iter()
            .map(|row| {
                let values = columns
                    .iter()
                    .map(|c| row.get(c.as_str()).map_or_else(|| "NULL".to_string(), literal))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({values})")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        run(
            engine,
            step,
            &format!(
                "INSERT INTO {} ({column_list}) VALUES {tuples}",
                quote_ident(&data.table)
            ),
        )
        .await?;
        Ok(format!("re-inserted {} rows into {}", data.deleted_rows.len(), data.table))
    }
}
