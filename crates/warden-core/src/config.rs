//! Warden configuration
//!
//! Every option has a default, so an empty TOML document is a valid
//! configuration. Keys are camelCase to match the external interface:
//!
//! ```toml
//! memoryLimitBytes = 8589934592
//! maxConnections = 16
//!
//! [cloudFallback]
//! provider = "snowflake"
//! credentials = { account = "acme" }
//! ```

use crate::error::ConfigError;
use crate::types::OperationClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenConfig {
    /// Configured engine memory limit
    pub memory_limit_bytes: u64,
    /// Configured maximum concurrent connections
    pub max_connections: u32,
    /// Pressure sampling interval
    pub sample_interval_ms: u64,
    /// Escalation cooldown window
    pub cooldown_ms: u64,
    /// Hung-operation sweep interval
    pub hung_operation_sweep_ms: u64,
    /// Maximum crash-recovery attempts
    pub max_recovery_attempts: u32,
    /// Tier thresholds
    pub thresholds: ThresholdConfig,
    /// Per-class timeout budgets
    pub timeouts: TimeoutConfig,
    /// Tier remediation parameters
    pub remediation: RemediationConfig,
    /// Crash recovery parameters
    pub recovery: RecoveryConfig,
    /// Alternate backend parameters
    pub cloud_fallback: CloudFallbackConfig,
    /// Audit log parameters
    pub audit: AuditConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 4 * 1024 * 1024 * 1024,
            max_connections: 10,
            sample_interval_ms: 15_000,
            cooldown_ms: 300_000,
            hung_operation_sweep_ms: 10_000,
            max_recovery_attempts: 3,
            thresholds: ThresholdConfig::default(),
            timeouts: TimeoutConfig::default(),
            remediation: RemediationConfig::default(),
            recovery: RecoveryConfig::default(),
            cloud_fallback: CloudFallbackConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: WardenConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// With memory limit
    #[inline]
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// With max connections
    #[inline]
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit_bytes == 0 {
            return Err(invalid("memoryLimitBytes", "must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(invalid("maxConnections", "must be greater than zero"));
        }
        if self.sample_interval_ms == 0 {
            return Err(invalid("sampleIntervalMs", "must be greater than zero"));
        }
        if self.hung_operation_sweep_ms == 0 {
            return Err(invalid("hungOperationSweepMs", "must be greater than zero"));
        }
        if self.max_recovery_attempts == 0 {
            return Err(invalid("maxRecoveryAttempts", "must be at least 1"));
        }
        self.thresholds.validate()?;

        let r = &self.remediation;
        for (field, factor) in [
            ("remediation.warningConnectionFactor", r.warning_connection_factor),
            ("remediation.criticalConnectionFactor", r.critical_connection_factor),
            ("remediation.criticalMemoryFactor", r.critical_memory_factor),
            ("remediation.emergencyMemoryFactor", r.emergency_memory_factor),
        ] {
            if !(factor > 0.0 && factor <= 1.0) {
                return Err(invalid(field, format!("{factor} is outside (0, 1]")));
            }
        }
        if !(0.0..=100.0).contains(&r.relief_safety_ceiling_percent) {
            return Err(invalid(
                "remediation.reliefSafetyCeilingPercent",
                "must be a percentage",
            ));
        }
        if self.cloud_fallback.latency_window == 0 {
            return Err(invalid("cloudFallback.latencyWindow", "must be at least 1"));
        }
        Ok(())
    }

    /// Sampling interval as a duration
    #[inline]
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Cooldown as a duration
    #[inline]
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Sweep interval as a duration
    #[inline]
    #[must_use]
    pub fn hung_operation_sweep(&self) -> Duration {
        Duration::from_millis(self.hung_operation_sweep_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Usage percentages at which each tier starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdConfig {
    /// CAUTION at or above
    pub caution: f64,
    /// WARNING at or above
    pub warning: f64,
    /// CRITICAL at or above
    pub critical: f64,
    /// EMERGENCY at or above
    pub emergency: f64,
    /// Usage at or above which escalation ignores the cooldown
    pub cooldown_bypass: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            caution: 70.0,
            warning: 80.0,
            critical: 90.0,
            emergency: 95.0,
            cooldown_bypass: 90.0,
        }
    }
}

impl ThresholdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.caution < self.warning
            && self.warning < self.critical
            && self.critical < self.emergency;
        if !ordered || self.caution <= 0.0 {
            return Err(invalid(
                "thresholds",
                "caution < warning < critical < emergency must hold",
            ));
        }
        Ok(())
    }
}

/// Per-class timeout budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Simple operations
    pub simple_ms: u64,
    /// Complex operations
    pub complex_ms: u64,
    /// Bulk operations
    pub bulk_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            simple_ms: OperationClass::Simple.default_budget().as_millis() as u64,
            complex_ms: OperationClass::Complex.default_budget().as_millis() as u64,
            bulk_ms: OperationClass::Bulk.default_budget().as_millis() as u64,
        }
    }
}

impl TimeoutConfig {
    /// Budget for a class
    #[inline]
    #[must_use]
    pub fn budget(&self, class: OperationClass) -> Duration {
        Duration::from_millis(match class {
            OperationClass::Simple => self.simple_ms,
            OperationClass::Complex => self.complex_ms,
            OperationClass::Bulk => self.bulk_ms,
        })
    }
}

/// Parameters of the tier remediations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemediationConfig {
    /// WARNING keeps this share of the original connection limit
    pub warning_connection_factor: f64,
    /// CRITICAL keeps this share of the original connection limit
    pub critical_connection_factor: f64,
    /// CRITICAL keeps this share of the original memory limit
    pub critical_memory_factor: f64,
    /// EMERGENCY keeps this share of the memory limit in force
    pub emergency_memory_factor: f64,
    /// Row cap applied to SELECT-style queries from WARNING up
    pub result_row_cap: u64,
    /// Pause between queued queries at CRITICAL
    pub queue_delay_ms: u64,
    /// Wait before re-sampling after emergency relief
    pub relief_settle_delay_ms: u64,
    /// Relief succeeds when usage falls under this percentage
    pub relief_safety_ceiling_percent: f64,
    /// Operations older than this are cancelled by emergency relief
    pub long_running_ms: u64,
    /// Divisor applied to the sampling interval from CAUTION up
    pub sampling_speedup: u32,
    /// Routine cleanup interval at NORMAL
    pub cleanup_interval_ms: u64,
    /// Routine cleanup interval from CAUTION up
    pub fast_cleanup_interval_ms: u64,
    /// Tables with these prefixes count as scratch tables
    pub temp_table_prefixes: Vec<String>,
    /// Statements run by the cooperative cleanup pass
    pub cooperative_cleanup: Vec<String>,
    /// Statements run by the aggressive cleanup pass
    pub aggressive_cleanup: Vec<String>,
    /// Statements that switch the engine to spill aggressively
    pub spill_statements: Vec<String>,
    /// Statements that undo the spill settings
    pub spill_reset_statements: Vec<String>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            warning_connection_factor: 0.7,
            critical_connection_factor: 0.5,
            critical_memory_factor: 0.8,
            emergency_memory_factor: 0.5,
            result_row_cap: 10_000,
            queue_delay_ms: 100,
            relief_settle_delay_ms: 5_000,
            relief_safety_ceiling_percent: 90.0,
            long_running_ms: 10_000,
            sampling_speedup: 2,
            cleanup_interval_ms: 300_000,
            fast_cleanup_interval_ms: 60_000,
            temp_table_prefixes: vec!["temp_".into(), "tmp_".into(), "scratch_".into()],
            cooperative_cleanup: vec!["CHECKPOINT".into()],
            aggressive_cleanup: vec![
                "FORCE CHECKPOINT".into(),
                "SET threads TO 1".into(),
            ],
            spill_statements: vec![
                "SET preserve_insertion_order = false".into(),
                "SET temp_directory = '.warden_spill'".into(),
            ],
            spill_reset_statements: vec![
                "RESET preserve_insertion_order".into(),
                "RESET threads".into(),
            ],
        }
    }
}

impl RemediationConfig {
    /// Relief settle delay
    #[inline]
    #[must_use]
    pub fn relief_settle_delay(&self) -> Duration {
        Duration::from_millis(self.relief_settle_delay_ms)
    }

    /// Queue inter-query delay
    #[inline]
    #[must_use]
    pub fn queue_delay(&self) -> Duration {
        Duration::from_millis(self.queue_delay_ms)
    }

    /// Whether a table name is a scratch table
    #[must_use]
    pub fn is_temp_table(&self, name: &str) -> bool {
        self.temp_table_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Crash-recovery parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryConfig {
    /// Health probe interval
    pub health_check_interval_ms: u64,
    /// Health probe timeout
    pub health_check_timeout_ms: u64,
    /// Backoff base between attempts (doubles per attempt)
    pub backoff_base_ms: u64,
    /// Engine data file; absent means in-memory
    pub data_path: Option<PathBuf>,
    /// Directory searched for backup artifacts
    pub backup_dir: Option<PathBuf>,
    /// File extension of backup artifacts
    pub backup_extension: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            backoff_base_ms: 2_000,
            data_path: None,
            backup_dir: None,
            backup_extension: "backup".into(),
        }
    }
}

impl RecoveryConfig {
    /// Probe interval
    #[inline]
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Probe timeout
    #[inline]
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Backoff before the attempt following `attempt` (1-based)
    #[inline]
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Alternate backend provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackProvider {
    /// No provider configured, fallback disabled
    #[default]
    None,
    /// Snowflake warehouse
    Snowflake,
    /// Google BigQuery
    BigQuery,
    /// Amazon Redshift
    Redshift,
    /// PostgreSQL-compatible service
    Postgres,
}

impl FallbackProvider {
    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            FallbackProvider::None => "none",
            FallbackProvider::Snowflake => "snowflake",
            FallbackProvider::BigQuery => "bigquery",
            FallbackProvider::Redshift => "redshift",
            FallbackProvider::Postgres => "postgres",
        }
    }
}

impl std::fmt::Display for FallbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alternate backend parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudFallbackConfig {
    /// Provider to connect to
    pub provider: FallbackProvider,
    /// Provider credentials, opaque to Warden
    pub credentials: BTreeMap<String, String>,
    /// Where exported tables are written
    pub export_dir: PathBuf,
    /// Bounded wait for in-flight operations to finish
    pub drain_timeout_ms: u64,
    /// Average latency above which fallback activates
    pub latency_threshold_ms: u64,
    /// Operations in the latency window
    pub latency_window: usize,
    /// Consecutive failures that activate fallback
    pub consecutive_failure_threshold: u32,
    /// Usage after emergency relief that activates fallback
    pub sustained_memory_percent: f64,
}

impl Default for CloudFallbackConfig {
    fn default() -> Self {
        Self {
            provider: FallbackProvider::None,
            credentials: BTreeMap::new(),
            export_dir: PathBuf::from("warden_export"),
            drain_timeout_ms: 60_000,
            latency_threshold_ms: 30_000,
            latency_window: 20,
            consecutive_failure_threshold: 5,
            sustained_memory_percent: 95.0,
        }
    }
}

impl CloudFallbackConfig {
    /// Whether a provider is configured
    #[inline]
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.provider != FallbackProvider::None
    }

    /// Drain timeout
    #[inline]
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Latency threshold
    #[inline]
    #[must_use]
    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }
}

/// Audit log parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    /// Events kept in memory
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}
