#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::audit::{AuditOperation, AuditOutcome};
use warden_core::WardenError;
use warden_recovery::story::{FeatureToggleStore, InMemoryToggleStore, JsonFileToggleStore};
use warden_recovery::{RollbackStatus, StoryRollbackOrchestrator, UnitDefinition, UnitRegistry};
use warden_test_utils::capture_events;

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn unit(dir: &Path, script: PathBuf) -> UnitDefinition {
    UnitDefinition {
        id: "1.2".into(),
        feature_toggle: "dashboard_v2".into(),
        script,
        files: vec![dir.join("models/dashboard_v2.sql"), dir.join("widgets/trend.svelte")],
        dependencies: vec![],
        validation_script: None,
    }
}

#[tokio::test]
async fn already_rolled_back_unit_completes_again() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(
        dir.path(),
        "rollback-1.2.sh",
        "echo \"rolling back $UNIT_ID: $REASON (dry run: $DRY_RUN)\"\n",
    );
    let mut registry = UnitRegistry::new();
    registry.insert(unit(dir.path(), script));
    let toggles = Arc::new(InMemoryToggleStore::new().with("dashboard_v2", false));
    let (events, _) = capture_events();
    let orchestrator = StoryRollbackOrchestrator::new(registry, toggles.clone(), events.clone());

    for _ in 0..2 {
        let report = orchestrator.rollback_unit("1.2", "regression", false).await.unwrap();

        assert_eq!(report.status, RollbackStatus::Completed, "{report:?}");
        assert_eq!(report.pre_state.toggle_enabled, Some(false));
        assert!(report.pre_state.files.iter().all(|f| !f.exists));
        let script = report.script.as_ref().unwrap();
        assert_eq!(
            script.stdout.trim(),
            "rolling back 1.2: regression (dry run: false)"
        );
        assert!(report.validation.passed());
        assert!(report.to_error().is_none());
    }
    assert_eq!(toggles.get("dashboard_v2").await.unwrap(), Some(false));

    let audits = events.audit_log().events_for(AuditOperation::UnitRollback);
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().all(|e| e.outcome == AuditOutcome::Success));
}

#[tokio::test]
async fn enabled_toggle_is_disabled_and_files_checked() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("models")).unwrap();
    write(dir.path(), "models/dashboard_v2.sql", "select 1");
    let script = write(
        dir.path(),
        "rollback.sh",
        &format!("rm -f '{}'\n", dir.path().join("models/dashboard_v2.sql").display()),
    );
    let mut registry = UnitRegistry::new();
    registry.insert(unit(dir.path(), script));
    let toggle_file = dir.path().join("toggles.json");
    std::fs::write(&toggle_file, r#"{"dashboard_v2": true}"#).unwrap();
    let toggles = Arc::new(JsonFileToggleStore::new(&toggle_file));
    let (events, _) = capture_events();
    let orchestrator = StoryRollbackOrchestrator::new(registry, toggles.clone(), events);

    let report = orchestrator.rollback_unit("1.2", "bad data", false).await.unwrap();

    assert_eq!(report.status, RollbackStatus::Completed, "{report:?}");
    assert_eq!(report.pre_state.toggle_enabled, Some(true));
    assert_eq!(report.pre_state.files[0].size, Some(8));
    assert!(report.toggle_disabled);
    assert_eq!(toggles.get("dashboard_v2").await.unwrap(), Some(false));
}

#[tokio::test]
async fn failing_script_yields_failed_report() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(dir.path(), "rollback.sh", "echo 'migration locked' >&2\nexit 2\n");
    let mut registry = UnitRegistry::new();
    registry.insert(unit(dir.path(), script));
    let (events, sink) = capture_events();
    let orchestrator =
        StoryRollbackOrchestrator::new(registry, Arc::new(InMemoryToggleStore::new()), events.clone());

    let report = orchestrator.rollback_unit("1.2", "x", false).await.unwrap();

    assert_eq!(report.status, RollbackStatus::Failed);
    assert!(report.toggle_disabled);
    match report.to_error() {
        Some(WardenError::ExternalScriptFailed { exit_code, stderr, .. }) => {
            assert_eq!(exit_code, Some(2));
            assert!(stderr.contains("migration locked"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        events.audit_log().events_for(AuditOperation::UnitRollback)[0].outcome,
        AuditOutcome::Failure
    );
    assert_eq!(sink.with_severity(warden_core::Severity::Critical).len(), 1);
}

#[tokio::test]
async fn validation_script_and_leftover_files_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("models")).unwrap();
    write(dir.path(), "models/dashboard_v2.sql", "select 1");
    let script = write(dir.path(), "rollback.sh", "true\n");
    let validate = write(dir.path(), "validate.sh", "echo 'view still referenced' >&2\nexit 1\n");
    let mut def = unit(dir.path(), script);
    def.validation_script = Some(validate);
    let mut registry = UnitRegistry::new();
    registry.insert(def);
    let (events, _) = capture_events();
    let orchestrator =
        StoryRollbackOrchestrator::new(registry, Arc::new(InMemoryToggleStore::new()), events);

    let report = orchestrator.rollback_unit("1.2", "x", false).await.unwrap();

    assert_eq!(report.status, RollbackStatus::Failed);
    assert!(report.script.as_ref().unwrap().success());
    assert_eq!(report.validation.errors.len(), 2);
    assert!(matches!(report.to_error(), Some(WardenError::RollbackValidationFailed(e)) if e.len() == 2));
}

#[tokio::test]
async fn dry_run_leaves_toggle_alone() {
    let dir = tempfile::tempdir().unwrap();
    let script = write(dir.path(), "rollback.sh", "test \"$DRY_RUN\" = true\n");
    let mut registry = UnitRegistry::new();
    registry.insert(unit(dir.path(), script));
    let toggles = Arc::new(InMemoryToggleStore::new().with("dashboard_v2", true));
    let (events, _) = capture_events();
    let orchestrator = StoryRollbackOrchestrator::new(registry, toggles.clone(), events);

    let report = orchestrator.rollback_unit("1.2", "rehearsal", true).await.unwrap();

    assert_eq!(report.status, RollbackStatus::Completed, "{report:?}");
    assert!(!report.toggle_disabled);
    assert_eq!(toggles.get("dashboard_v2").await.unwrap(), Some(true));
}

#[tokio::test]
async fn unknown_unit_is_an_error() {
    let (events, _) = capture_events();
    let orchestrator = StoryRollbackOrchestrator::new(
        UnitRegistry::new(),
        Arc::new(InMemoryToggleStore::new()),
        events,
    );
    assert!(matches!(
        orchestrator.rollback_unit("9.9", "x", false).await,
        Err(WardenError::UnknownUnit(id)) if id == "9.9"
    ));
}
