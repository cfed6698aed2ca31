use proptest::prelude::*;
use serde_json::json;
use warden_core::audit::{AuditLog, AuditOperation, AuditOutcome};
use warden_core::sql::{quote_ident, quote_str};
use warden_core::{PressureSample, WardenConfig};

const OPERATIONS: [AuditOperation; 9] = [
    AuditOperation::TierTransition,
    AuditOperation::EmergencyRelief,
    AuditOperation::HungOperation,
    AuditOperation::RecoveryAttempt,
    AuditOperation::RecoveryCompleted,
    AuditOperation::FallbackActivated,
    AuditOperation::FallbackDeactivated,
    AuditOperation::OperationRollback,
    AuditOperation::UnitRollback,
];

proptest! {
    #[test]
    fn audit_chain_verifies_after_eviction(
        capacity in 1usize..20,
        ops in prop::collection::vec((0usize..9, any::<bool>(), any::<u32>()), 1..60),
    ) {
        let log = AuditLog::with_capacity(capacity);
        for (op, ok, n) in &ops {
            log.append(OPERATIONS[*op], AuditOutcome::from_success(*ok), json!({ "n": n }));
        }
        prop_assert_eq!(log.len(), ops.len().min(capacity));
        prop_assert_eq!(log.verify_integrity(), Ok(log.len()));

        let events = log.events();
        for pair in events.windows(2) {
            prop_assert_eq!(pair[1].sequence, pair[0].sequence + 1);
            prop_assert_eq!(&pair[1].prev_hash, &pair[0].hash);
        }
    }

    #[test]
    fn usage_is_a_ratio_of_the_limit(used in 0u64..1_000_000, limit in 1u64..1_000_000) {
        let sample = PressureSample::new(chrono::Utc::now(), used, limit, 0);
        let expected = used as f64 / limit as f64 * 100.0;
        prop_assert!((sample.usage_percent() - expected).abs() < 1e-9);
        prop_assert!(!sample.stale);
        prop_assert!(sample.into_stale().stale);
    }

    #[test]
    fn quoting_never_leaves_a_bare_delimiter(s in ".*") {
        let ident = quote_ident(&s);
        let inner = &ident[1..ident.len() - 1];
        prop_assert_eq!(inner.replace("\"\"", "").matches('"').count(), 0);

        let lit = quote_str(&s);
        let inner = &lit[1..lit.len() - 1];
        prop_assert_eq!(inner.replace("''", "").matches('\'').count(), 0);
    }
}

#[test]
fn zero_limit_reports_no_usage() {
    let sample = PressureSample::new(chrono::Utc::now(), 500, 0, 3);
    assert_eq!(sample.usage_percent(), 0.0);
}

#[test]
fn recognized_options_parse_from_toml() {
    let config = WardenConfig::from_toml_str(
        r#"
memoryLimitBytes = 8589934592
maxConnections = 32
sampleIntervalMs = 5000
cooldownMs = 60000
hungOperationSweepMs = 2000
maxRecoveryAttempts = 5

[cloudFallback]
provider = "bigquery"

[cloudFallback.credentials]
project = "analytics"
"#,
    )
    .unwrap();

    assert_eq!(config.memory_limit_bytes, 8 * 1024 * 1024 * 1024);
    assert_eq!(config.max_connections, 32);
    assert_eq!(config.sample_interval_ms, 5_000);
    assert_eq!(config.cooldown_ms, 60_000);
    assert_eq!(config.hung_operation_sweep_ms, 2_000);
    assert_eq!(config.max_recovery_attempts, 5);
    assert!(config.cloud_fallback.enabled());
    assert_eq!(
        config.cloud_fallback.credentials.get("project").map(String::as_str),
        Some("analytics")
    );
    assert_eq!(config.thresholds.emergency, 95.0);
}
