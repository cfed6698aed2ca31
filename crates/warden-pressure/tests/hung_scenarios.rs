use chrono::{Duration as ChronoDuration, Utc};
use mockall::{mock, predicate, Sequence};
use std::sync::Arc;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::engine::{EngineConfig, QueryResult, TableInfo};
use warden_core::error::EngineError;
use warden_core::{
    ConnectionId, EngineAdapter, EngineSlot, OperationClass, OperationId, ResponseTier,
    TimeoutConfig, TrackedOperation,
};
use warden_pressure::{HungOperationMonitor, ResourceSampler, ResponseController, StopStrategy};
use warden_test_utils::{capture_events, test_config, EngineCall, FakeEngine, FakeMemoryProbe};

mock! {
    Engine {}

    #[async_trait::async_trait]
    impl EngineAdapter for Engine {
        async fn execute(&self, query: &str) -> Result<QueryResult, EngineError>;
        async fn cancel(&self, operation: &OperationId) -> Result<(), EngineError>;
        async fn force_terminate(&self, operation: &OperationId) -> Result<(), EngineError>;
        async fn reset_connection(&self, connection: ConnectionId) -> Result<(), EngineError>;
        async fn close(&self) -> Result<(), EngineError>;
        async fn reinitialize(&self, config: &EngineConfig) -> Result<(), EngineError>;
        async fn list_tables(&self) -> Result<Vec<TableInfo>, EngineError>;
        async fn set_memory_limit(&self, bytes: u64) -> Result<(), EngineError>;
        async fn set_max_connections(&self, max: u32) -> Result<(), EngineError>;
    }
}

fn simple_op(id: &str, started: chrono::DateTime<Utc>) -> TrackedOperation {
    TrackedOperation {
        id: OperationId::new(id),
        class: OperationClass::Simple,
        start_time: started,
        connection_id: ConnectionId(3),
    }
}

#[tokio::test]
async fn simple_operation_over_budget_escalates_within_one_sweep() {
    let mut engine = MockEngine::new();
    let mut seq = Sequence::new();
    engine
        .expect_cancel()
        .with(predicate::eq(OperationId::new("q-simple")))
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(EngineError::QueryFailed("cancel not honoured".into())));
    engine
        .expect_force_terminate()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    engine.expect_reset_connection().never();

    let (events, sink) = capture_events();
    let monitor = HungOperationMonitor::new(
        EngineSlot::new(Arc::new(engine)),
        TimeoutConfig::default(),
        events.clone(),
    );
    let t0 = Utc::now();
    let ticket = monitor.begin(simple_op("q-simple", t0)).unwrap();

    let report = monitor.sweep_at(t0 + ChronoDuration::seconds(35)).await;

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.attempts.len(), 2);
    assert_eq!(outcome.attempts[0].strategy, StopStrategy::Cancel);
    assert!(!outcome.attempts[0].success);
    assert_eq!(outcome.resolved_by, Some(StopStrategy::ForceTerminate));
    assert!(ticket.is_cancelled());
    assert!(monitor.is_empty());

    let audits = events.audit_log().events_for(AuditOperation::HungOperation);
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].outcome, AuditOutcome::Success);
    assert_eq!(sink.received().len(), 1);
}

#[tokio::test]
async fn operation_under_budget_is_not_touched() {
    let mut engine = MockEngine::new();
    engine.expect_cancel().never();
    engine.expect_force_terminate().never();
    engine.expect_reset_connection().never();

    let (events, _) = capture_events();
    let monitor =
        HungOperationMonitor::new(EngineSlot::new(Arc::new(engine)), TimeoutConfig::default(), events);
    let t0 = Utc::now();
    monitor.begin(simple_op("q-fast", t0)).unwrap();

    let report = monitor.sweep_at(t0 + ChronoDuration::seconds(29)).await;
    assert!(report.outcomes.is_empty());
    assert_eq!(monitor.len(), 1);
}

#[tokio::test]
async fn emergency_relief_cancels_long_running_operations() {
    let config = test_config();
    let engine = Arc::new(FakeEngine::new());
    let slot = EngineSlot::new(engine.clone());
    let (events, _) = capture_events();

    let monitor = Arc::new(HungOperationMonitor::new(
        slot.clone(),
        config.timeouts,
        events.clone(),
    ));
    let probe = Arc::new(FakeMemoryProbe::new(980));
    let sampler = Arc::new(ResourceSampler::new(
        probe,
        config.memory_limit_bytes,
        config.sample_interval(),
    ));
    sampler.set_operation_source(monitor.clone());
    let controller = ResponseController::new(&config, slot, sampler, events.clone());
    controller.set_canceller(monitor.clone());

    let now = Utc::now();
    monitor
        .begin(TrackedOperation {
            id: OperationId::new("long"),
            class: OperationClass::Bulk,
            start_time: now - ChronoDuration::seconds(60),
            connection_id: ConnectionId(1),
        })
        .unwrap();
    monitor.register(OperationClass::Simple, ConnectionId(2));

    let outcome = controller.tick().await;
    assert_eq!(outcome.tier(), Some(ResponseTier::Emergency));
    let relief = outcome.relief().unwrap();
    assert_eq!(relief.steps[0].detail, "1 operations stopped");
    assert_eq!(monitor.len(), 1);
    assert_eq!(
        engine.count_calls(|c| matches!(c, EngineCall::Cancel(id) if id.as_str() == "long")),
        1
    );

    let transitions = events.audit_log().events_for(AuditOperation::TierTransition);
    assert_eq!(transitions.len(), 1);
    assert_eq!(events.audit_log().events_for(AuditOperation::EmergencyRelief).len(), 1);
    assert!(events.audit_log().verify_integrity().is_ok());
}
