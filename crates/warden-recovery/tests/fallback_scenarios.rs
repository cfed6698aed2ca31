use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::{
    ActiveOperationSource, Admission, CloudFallbackConfig, EngineAdapter, EngineError, EngineSlot,
    FallbackProvider, Severity, WardenError,
};
use warden_recovery::{BackendConnector, CloudFallbackManager, FallbackReason};
use warden_test_utils::{capture_events, FakeEngine};

struct StubConnector {
    remote: Arc<FakeEngine>,
    connects: AtomicUsize,
    fail: AtomicBool,
}

impl StubConnector {
    fn new(remote: Arc<FakeEngine>) -> Self {
        Self {
            remote,
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl BackendConnector for StubConnector {
    async fn connect(
        &self,
        provider: &FallbackProvider,
        credentials: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn EngineAdapter>, EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        assert_eq!(provider, &FallbackProvider::Snowflake);
        assert_eq!(credentials.get("account").map(String::as_str), Some("acme"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("authentication rejected".into()));
        }
        Ok(self.remote.clone())
    }
}

struct Busy(AtomicUsize);

impl ActiveOperationSource for Busy {
    fn active_count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn config(export_dir: &std::path::Path) -> CloudFallbackConfig {
    let mut config = CloudFallbackConfig {
        provider: FallbackProvider::Snowflake,
        export_dir: export_dir.to_path_buf(),
        drain_timeout_ms: 200,
        ..CloudFallbackConfig::default()
    };
    config.credentials.insert("account".into(), "acme".into());
    config
}

fn pressure() -> FallbackReason {
    FallbackReason::SustainedMemoryPressure { usage_percent: 97.0 }
}

#[tokio::test]
async fn concurrent_activations_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FakeEngine::named("local").with_table("orders", 3));
    let remote = Arc::new(FakeEngine::named("remote"));
    let connector = Arc::new(StubConnector::new(remote.clone()));
    let slot = EngineSlot::new(local.clone());
    let (events, _) = capture_events();
    let manager = CloudFallbackManager::new(&config(dir.path()), slot.clone(), connector.clone(), events.clone());

    let (a, b) = tokio::join!(
        manager.activate(pressure()),
        manager.activate(FallbackReason::ConsecutiveFailures { count: 5 })
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.id, b.id);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(events.audit_log().events_for(AuditOperation::FallbackActivated).len(), 1);
    assert!(manager.is_active());
    assert_eq!(slot.current().name(), "translating");
}

#[tokio::test]
async fn activation_exports_durable_tables_and_reroutes() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(
        FakeEngine::named("local")
            .with_table("orders", 3)
            .with_table("customers", 2)
            .with_temp_table("temp_scratch", 1),
    );
    local.fail_queries_containing("customers.parquet");
    let remote = Arc::new(FakeEngine::named("remote"));
    let slot = EngineSlot::new(local.clone());
    let admission = Arc::new(Admission::new());
    let (events, sink) = capture_events();
    let manager = CloudFallbackManager::new(
        &config(dir.path()),
        slot.clone(),
        Arc::new(StubConnector::new(remote.clone())),
        events.clone(),
    )
    .with_admission(admission.clone());

    let session = manager.activate(pressure()).await.unwrap();

    assert_eq!(session.exported_tables, vec![dir.path().join("orders.parquet")]);
    assert_eq!(session.export_failures.len(), 1);
    assert_eq!(session.export_failures[0].table, "customers");
    assert!(local.queries_containing("temp_scratch").is_empty());
    assert!(!admission.is_paused());

    slot.current().execute("PRAGMA threads=2").await.unwrap();
    slot.current().execute("SELECT * FROM orders USING SAMPLE 10%").await.unwrap();
    assert_eq!(remote.queries(), vec!["SELECT * FROM orders SAMPLE (10)".to_string()]);

    let activated = events.audit_log().events_for(AuditOperation::FallbackActivated);
    assert_eq!(activated[0].outcome, AuditOutcome::Partial);
    assert_eq!(sink.with_severity(Severity::Critical).len(), 1);
}

#[tokio::test]
async fn failed_connection_latches_and_keeps_local_engine() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FakeEngine::named("local"));
    let connector = Arc::new(StubConnector::new(Arc::new(FakeEngine::named("remote"))));
    connector.fail.store(true, Ordering::SeqCst);
    let slot = EngineSlot::new(local.clone());
    let admission = Arc::new(Admission::new());
    let (events, sink) = capture_events();
    let manager = CloudFallbackManager::new(&config(dir.path()), slot.clone(), connector.clone(), events.clone())
        .with_admission(admission.clone());

    let err = manager.activate(pressure()).await.unwrap_err();
    assert!(matches!(err, WardenError::FallbackActivationFailed(_)));
    assert!(manager.activation_failed());
    assert!(!manager.is_active());
    assert!(!admission.is_paused());
    assert_eq!(slot.current().name(), "local");
    assert_eq!(sink.with_severity(Severity::Emergency).len(), 1);

    connector.fail.store(false, Ordering::SeqCst);
    assert!(manager.activate(pressure()).await.is_err());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    manager.reset_failure();
    assert!(manager.activate(pressure()).await.is_ok());
    let outcomes: Vec<_> = events
        .audit_log()
        .events_for(AuditOperation::FallbackActivated)
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Failure, AuditOutcome::Success]);
}

#[tokio::test]
async fn drain_gives_up_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FakeEngine::named("local"));
    let (events, _) = capture_events();
    let manager = CloudFallbackManager::new(
        &config(dir.path()),
        EngineSlot::new(local),
        Arc::new(StubConnector::new(Arc::new(FakeEngine::named("remote")))),
        events,
    );
    manager.set_operation_source(Arc::new(Busy(AtomicUsize::new(2))));

    let session = manager.activate(pressure()).await.unwrap();
    assert!(!session.drained);
    assert!(session.active);
}

#[tokio::test]
async fn deactivation_restores_local_engine_and_reimports() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(FakeEngine::named("local").with_table("orders", 3));
    let remote = Arc::new(FakeEngine::named("remote"));
    let slot = EngineSlot::new(local.clone());
    let (events, _) = capture_events();
    let manager = CloudFallbackManager::new(
        &config(dir.path()),
        slot.clone(),
        Arc::new(StubConnector::new(remote)),
        events.clone(),
    );

    assert!(manager.deactivate(true).await.unwrap().is_none());
    manager.activate(pressure()).await.unwrap();
    let report = manager.deactivate(true).await.unwrap().unwrap();

    assert!(!report.session.active);
    assert_eq!(report.reimported, vec!["orders".to_string()]);
    assert_eq!(slot.current().name(), "local");
    assert!(!manager.is_active());
    assert!(manager.session().await.is_none());
    assert_eq!(local.queries_containing("read_parquet").len(), 1);
    assert_eq!(
        events.audit_log().events_for(AuditOperation::FallbackDeactivated)[0].outcome,
        AuditOutcome::Success
    );
}

#[tokio::test]
async fn disabled_provider_refuses_activation() {
    let dir = tempfile::tempdir().unwrap();
    let (events, _) = capture_events();
    let mut cfg = config(dir.path());
    cfg.provider = FallbackProvider::None;
    let manager = CloudFallbackManager::new(
        &cfg,
        EngineSlot::new(Arc::new(FakeEngine::new())),
        Arc::new(StubConnector::new(Arc::new(FakeEngine::new()))),
        events,
    );
    assert!(matches!(
        manager.activate(pressure()).await,
        Err(WardenError::FallbackActivationFailed(_))
    ));
    assert!(!manager.activation_failed());
}
