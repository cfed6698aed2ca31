#![cfg(unix)]

use serde_json::json;
use std::sync::Arc;
use warden::commands;
use warden::Warden;
use warden_core::{OperationClass, OperationId};
use warden_recovery::RollbackStatus;
use warden_test_utils::{capture_events, test_config, FakeEngine, FakeMemoryProbe};

#[tokio::test]
async fn rollback_unit_reads_registry_and_toggle_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("rollback.sh"), "echo \"undo $UNIT_ID\"\n").unwrap();
    std::fs::write(
        dir.path().join("units.toml"),
        r#"
[[unit]]
id = "1.2"
featureToggle = "trend_widget"
script = "rollback.sh"
files = ["widgets/trend.svelte"]
"#,
    )
    .unwrap();
    let toggles = dir.path().join("toggles.json");
    std::fs::write(&toggles, r#"{"trend_widget": true}"#).unwrap();
    let (events, _) = capture_events();

    let report = commands::rollback_unit(
        &dir.path().join("units.toml"),
        &toggles,
        "1.2",
        "bad numbers",
        false,
        events,
    )
    .await
    .unwrap();

    assert_eq!(report.status, RollbackStatus::Completed, "{report:?}");
    assert_eq!(report.script.unwrap().stdout.trim(), "undo 1.2");
    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&toggles).unwrap()).unwrap();
    assert_eq!(stored["trend_widget"], json!(false));
}

#[tokio::test]
async fn facade_rollback_undoes_protected_inserts() {
    let engine = Arc::new(FakeEngine::new().with_table("orders", 2));
    let (events, _) = capture_events();
    let warden = Warden::builder(test_config(), engine.clone())
        .with_probe(Arc::new(FakeMemoryProbe::new(0)))
        .with_events(events)
        .build()
        .unwrap();
    let id = OperationId::new("nightly-load");

    warden
        .rollback()
        .begin(id.clone(), "load", json!({ "tables": ["orders"] }))
        .await
        .unwrap();
    warden
        .execute("INSERT INTO orders VALUES (1), (2), (3)", OperationClass::Bulk)
        .await
        .unwrap();
    warden
        .rollback()
        .record_step(&id, "insert_data", json!({ "table": "orders", "rows": 3 }))
        .unwrap();
    assert_eq!(engine.row_count("orders"), Some(5));

    let result = warden.rollback().rollback(&id, "downstream check failed").await.unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(engine.row_count("orders"), Some(2));
}
