use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{EngineAdapter, EngineSlot, OperationId, WardenError, WardenResult};
use warden_recovery::rollback::{Checkpoint, Compensator, StepRecord};
use warden_recovery::{OperationRollbackManager, OperationStatus};
use warden_test_utils::{capture_events, FakeEngine};

struct AlwaysFails;

#[async_trait::async_trait]
impl Compensator for AlwaysFails {
    async fn compensate(
        &self,
        _engine: &dyn EngineAdapter,
        step: &StepRecord,
        _checkpoint: &Checkpoint,
    ) -> WardenResult<String> {
        Err(WardenError::RollbackStepFailed {
            step: step.name.clone(),
            reason: "refresh cannot be undone".into(),
        })
    }
}

fn manager(engine: &Arc<FakeEngine>) -> (OperationRollbackManager, Arc<warden_core::NotificationManager>) {
    let (events, _) = capture_events();
    (
        OperationRollbackManager::new(EngineSlot::new(engine.clone()), events.clone()),
        events,
    )
}

#[tokio::test]
async fn failing_second_compensator_does_not_stop_the_first() {
    let engine = Arc::new(FakeEngine::new().with_table("orders", 5));
    let (rollback, events) = manager(&engine);
    rollback.register_compensator("refresh_view", Arc::new(AlwaysFails));
    let id = OperationId::new("op-e");

    rollback.begin(id.clone(), "load", json!({ "tables": ["orders"] })).await.unwrap();
    engine.insert_rows("orders", 3);
    rollback
        .record_step(&id, "insert_data", json!({ "table": "orders", "rows": 3 }))
        .unwrap();
    rollback
        .record_step(&id, "refresh_view", json!({ "view": "daily" }))
        .unwrap();

    let result = rollback.rollback(&id, "load failed").await.unwrap();

    assert_eq!(result.compensations.len(), 2);
    assert_eq!(result.compensations[0].index, 1);
    assert!(!result.compensations[0].success);
    assert_eq!(result.compensations[1].index, 0);
    assert!(result.compensations[1].success);
    assert_eq!(result.unresolved, vec!["1:refresh_view".to_string()]);
    assert!(result.drift.is_empty());
    assert!(!result.success);
    assert_eq!(engine.row_count("orders"), Some(5));

    let audits = events.audit_log().events_for(AuditOperation::OperationRollback);
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].outcome, AuditOutcome::Partial);
    assert!(matches!(result.to_error(), Some(WardenError::RollbackValidationFailed(p)) if p.len() == 1));
    assert_eq!(rollback.record(&id).unwrap().status, OperationStatus::RolledBack);
}

#[tokio::test]
async fn create_and_insert_round_trip_restores_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().with_table("orders", 5).with_temp_table("temp_x", 9));
    let (events, _) = capture_events();
    let rollback =
        OperationRollbackManager::new(EngineSlot::new(engine.clone()), events).with_store_dir(dir.path());
    let id = OperationId::new("op-rt");

    let checkpoint = rollback.begin(id.clone(), "import", json!({})).await.unwrap();
    assert_eq!(checkpoint.table_row_counts.get("orders"), Some(&5));
    assert!(!checkpoint.table_row_counts.contains_key("temp_x"));
    let stored = checkpoint.backing_store_path.clone().unwrap();
    assert!(stored.exists());

    engine.create_table("staging");
    rollback.record_step(&id, "create_table", json!({ "table": "staging" })).unwrap();
    engine.insert_rows("staging", 4);
    rollback
        .record_step(&id, "insert_data", json!({ "table": "staging", "rows": 4 }))
        .unwrap();
    engine.insert_rows("orders", 2);
    rollback
        .record_step(&id, "insert_data", json!({ "table": "orders", "rows": 2 }))
        .unwrap();

    let result = rollback.rollback(&id, "validation failed").await.unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(engine.row_count("orders"), Some(5));
    assert!(!engine.has_table("staging"));
    assert!(!stored.exists());
    assert!(rollback.checkpoint_for(&id).is_none());
}

#[tokio::test]
async fn complete_consumes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(FakeEngine::new().with_table("orders", 1));
    let (events, _) = capture_events();
    let rollback =
        OperationRollbackManager::new(EngineSlot::new(engine.clone()), events).with_store_dir(dir.path());
    let id = OperationId::new("op-ok");

    let checkpoint = rollback.begin(id.clone(), "noop", json!({})).await.unwrap();
    let record = rollback.complete(&id, json!({ "rows": 0 })).await.unwrap();

    assert_eq!(record.status, OperationStatus::Completed);
    assert!(!checkpoint.backing_store_path.unwrap().exists());
    assert!(matches!(
        rollback.rollback(&id, "late").await,
        Err(WardenError::UnknownOperation(_))
    ));
    assert!(matches!(
        rollback.record_step(&id, "insert_data", json!({})),
        Err(WardenError::UnknownOperation(_))
    ));
}

#[tokio::test]
async fn duplicate_begin_is_rejected() {
    let engine = Arc::new(FakeEngine::new());
    let (rollback, _) = manager(&engine);
    let id = OperationId::new("dup");
    rollback.begin(id.clone(), "a", json!({ "tables": [] })).await.unwrap();
    assert!(matches!(
        rollback.begin(id.clone(), "a", json!({ "tables": [] })).await,
        Err(WardenError::OperationAlreadyActive(_))
    ));
    assert_eq!(rollback.in_progress(), vec![id]);
}

#[tokio::test]
async fn missing_compensator_is_unresolved() {
    let engine = Arc::new(FakeEngine::new().with_table("orders", 1));
    let (rollback, _) = manager(&engine);
    let id = OperationId::new("op-x");
    rollback.begin(id.clone(), "x", json!({ "tables": ["orders"] })).await.unwrap();
    rollback.record_step(&id, "vacuum", json!({})).unwrap();

    let result = rollback.rollback(&id, "x").await.unwrap();
    assert_eq!(result.unresolved, vec!["0:vacuum".to_string()]);
    assert!(result.compensations[0].detail.contains("no compensator"));
}

#[tokio::test]
async fn drift_is_reported() {
    let engine = Arc::new(FakeEngine::new().with_table("orders", 5));
    let (rollback, _) = manager(&engine);
    let id = OperationId::new("op-d");
    rollback.begin(id.clone(), "x", json!({ "tables": ["orders"] })).await.unwrap();
    engine.insert_rows("orders", 3);
    rollback
        .record_step(&id, "insert_data", json!({ "table": "orders", "rows": 1 }))
        .unwrap();

    let result = rollback.rollback(&id, "x").await.unwrap();
    assert!(result.unresolved.is_empty());
    assert_eq!(result.drift.len(), 1);
    assert_eq!(result.drift[0].actual, Some(7));
    assert!(!result.success);
    assert!(rollback.checkpoint_for(&id).is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn inserts_roll_back_to_checkpoint(initial in 0u64..50, batches in prop::collection::vec(0u64..20, 0..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let engine = Arc::new(FakeEngine::new().with_table("t", initial));
            let (rollback, _) = manager(&engine);
            let id = OperationId::new("prop");
            rollback.begin(id.clone(), "batch", json!({ "tables": ["t"] })).await.unwrap();
            for rows in &batches {
                engine.insert_rows("t", *rows);
                rollback.record_step(&id, "insert_data", json!({ "table": "t", "rows": rows })).unwrap();
            }
            let result = rollback.rollback(&id, "prop").await.unwrap();
            prop_assert!(result.success);
            prop_assert_eq!(engine.row_count("t"), Some(initial));
            Ok(())
        })?;
    }
}
