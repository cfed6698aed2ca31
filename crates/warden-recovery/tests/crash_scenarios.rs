use std::sync::Arc;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{EngineSlot, Severity, WardenError};
use warden_recovery::{CrashRecoveryManager, RecoveryStep};
use warden_test_utils::{capture_events, test_config, EngineCall, FakeEngine};

#[tokio::test]
async fn in_memory_engine_without_backup_exhausts_three_attempts() {
    let mut config = test_config();
    config.max_recovery_attempts = 3;
    let engine = Arc::new(FakeEngine::new());
    engine.set_available(false);
    let (events, sink) = capture_events();
    let manager = CrashRecoveryManager::new(&config, EngineSlot::new(engine.clone()), events.clone());

    for _ in 0..3 {
        assert!(!manager.health_check().await.healthy);
    }
    assert_eq!(manager.consecutive_failures(), 3);

    let report = manager.recover().await;

    assert!(!report.success);
    assert_eq!(report.attempts.len(), 3);
    for (i, attempt) in report.attempts.iter().enumerate() {
        assert_eq!(attempt.attempt_number, i as u32 + 1);
        assert!(!attempt.success);
        assert_eq!(attempt.steps_executed.len(), 4);
        assert_eq!(attempt.failed_step(), Some(RecoveryStep::Restore));
        assert!(attempt.steps_executed[2].detail.contains("not recoverable"));
    }
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::Reinitialize(_))),
        0
    );

    let log = events.audit_log();
    let attempts = log.events_for(AuditOperation::RecoveryAttempt);
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|e| e.outcome == AuditOutcome::Failure));
    let completed = log.events_for(AuditOperation::RecoveryCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].outcome, AuditOutcome::Failure);

    assert_eq!(sink.with_severity(Severity::Critical).len(), 1);
    assert!(matches!(report.to_error(), Some(WardenError::EngineUnavailable(_))));
}

#[tokio::test]
async fn second_attempt_succeeds_after_transient_reinit_failure() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("warehouse.db");
    std::fs::write(&data, b"pages").unwrap();
    let mut config = test_config();
    config.recovery.data_path = Some(data);

    let engine = Arc::new(FakeEngine::new());
    engine.set_reinit_ok(false);
    let (events, _) = capture_events();
    let manager = CrashRecoveryManager::new(&config, EngineSlot::new(engine.clone()), events.clone());

    let flip = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while engine.count_calls(|c| matches!(c, EngineCall::Reinitialize(_))) == 0 {
                tokio::task::yield_now().await;
            }
            engine.set_reinit_ok(true);
        })
    };
    let report = manager.recover().await;
    flip.await.unwrap();

    assert!(report.success);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[1].steps_executed.len(), 7);
    let completed = events.audit_log().events_for(AuditOperation::RecoveryCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].outcome, AuditOutcome::Success);
}

#[tokio::test]
async fn concurrent_recover_calls_run_one_at_a_time() {
    let mut config = test_config();
    config.max_recovery_attempts = 1;
    let engine = Arc::new(FakeEngine::new());
    let (events, _) = capture_events();
    let manager = CrashRecoveryManager::new(&config, EngineSlot::new(engine.clone()), events.clone());

    let (a, b) = tokio::join!(manager.recover(), manager.recover());
    assert_eq!(a.attempts.len(), 1);
    assert_eq!(b.attempts.len(), 1);
    assert!(a.finished_at <= b.started_at || b.finished_at <= a.started_at);
    assert_eq!(manager.history().len(), 2);
}
