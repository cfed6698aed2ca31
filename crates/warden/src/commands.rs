//! Operator commands behind the `warden` binary

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use warden_core::{
    ConfigError, EventSink, PressureSample, ResponseTier, WardenConfig, WardenResult,
};
use warden_pressure::EscalationPolicy;
use warden_recovery::{JsonFileToggleStore, RollbackReport, StoryRollbackOrchestrator, UnitRegistry};

/// Load and validate a configuration file; defaults when no path is given
pub fn check_config(path: Option<&Path>) -> Result<WardenConfig, ConfigError> {
    match path {
        Some(path) => WardenConfig::load(path),
        None => {
            let config = WardenConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Outcome of a dry-run policy evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// Usage evaluated
    pub usage_percent: f64,
    /// Tier in force before the evaluation
    pub current: ResponseTier,
    /// Tier the usage maps to without hysteresis
    pub raw: ResponseTier,
    /// Tier the policy settles on
    pub target: ResponseTier,
    /// Whether the cooldown window had passed
    pub cooldown_elapsed: bool,
}

/// Evaluate the escalation policy for `usage_percent` at tier `current`.
///
/// `since_last_transition` is the time since the previous tier change;
/// `None` means there has been none.
#[must_use]
pub fn evaluate(
    config: &WardenConfig,
    usage_percent: f64,
    current: ResponseTier,
    since_last_transition: Option<std::time::Duration>,
) -> Evaluation {
    let policy = EscalationPolicy::from_config(config);
    let now = Utc::now();
    let last = since_last_transition
        .and_then(|d| ChronoDuration::from_std(d).ok())
        .map(|d| now - d);

    // Any positive limit works; the policy only sees the ratio.
    let limit = 1_000_000u64;
    let used = (usage_percent.max(0.0) / 100.0 * limit as f64).round() as u64;
    let sample = PressureSample::new(now, used, limit, 0);

    Evaluation {
        usage_percent,
        current,
        raw: policy.tier_for(sample.usage_percent()),
        target: policy.evaluate(&sample, current, last, now),
        cooldown_elapsed: policy.cooldown_elapsed(last, now),
    }
}

/// Roll back `unit` using a TOML unit registry and a JSON toggle file
pub async fn rollback_unit(
    registry: &Path,
    toggles: &Path,
    unit: &str,
    reason: &str,
    dry_run: bool,
    events: Arc<dyn EventSink>,
) -> WardenResult<RollbackReport> {
    let registry = UnitRegistry::load(registry)?;
    let toggles = Arc::new(JsonFileToggleStore::new(toggles));
    StoryRollbackOrchestrator::new(registry, toggles, events)
        .rollback_unit(unit, reason, dry_run)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn emergency_usage_bypasses_cooldown() {
        let config = WardenConfig::default();
        let eval = evaluate(&config, 96.0, ResponseTier::Caution, Some(Duration::from_secs(1)));
        assert_eq!(eval.target, ResponseTier::Emergency);
        assert!(!eval.cooldown_elapsed);
    }

    #[test]
    fn de_escalation_waits_for_cooldown() {
        let config = WardenConfig::default();
        let held = evaluate(&config, 50.0, ResponseTier::Warning, Some(Duration::from_secs(10)));
        assert_eq!(held.raw, ResponseTier::Normal);
        assert_eq!(held.target, ResponseTier::Warning);

        let released = evaluate(&config, 50.0, ResponseTier::Warning, Some(Duration::from_secs(301)));
        assert_eq!(released.target, ResponseTier::Normal);
    }

    #[test]
    fn first_evaluation_has_no_cooldown() {
        let eval = evaluate(&WardenConfig::default(), 72.0, ResponseTier::Normal, None);
        assert!(eval.cooldown_elapsed);
        assert_eq!(eval.target, ResponseTier::Caution);
    }

    #[test]
    fn check_config_defaults_and_file() {
        assert_eq!(check_config(None).unwrap(), WardenConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "memoryLimitBytes = 2048\nmaxConnections = 4\n").unwrap();
        let config = check_config(Some(&path)).unwrap();
        assert_eq!(config.memory_limit_bytes, 2048);
        assert_eq!(config.max_connections, 4);
    }
}
