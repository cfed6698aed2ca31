//! Per-tier remediation plans
//!
//! A plan is the full set of engine settings a tier wants in force. The
//! controller diffs the plan against what it has already applied, so
//! re-entering a tier changes nothing and leaving one restores the
//! settings the lower tier wants.

use serde::Serialize;
use std::time::Duration;
use warden_core::{RemediationConfig, ResponseTier, WardenConfig};

/// Engine limits as configured before any remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OriginalLimits {
    /// Configured memory limit
    pub memory_limit_bytes: u64,
    /// Configured connection limit
    pub max_connections: u32,
}

impl OriginalLimits {
    /// Limits from configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            max_connections: config.max_connections,
        }
    }
}

/// Settings a tier wants in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemediationPlan {
    /// Connection limit
    pub connection_limit: u32,
    /// Engine memory limit
    pub memory_limit_bytes: u64,
    /// Row cap for SELECT-style queries
    pub result_cap: Option<u64>,
    /// Serialize queries through the FIFO queue
    pub queueing: bool,
    /// Refuse new connections
    pub rejecting: bool,
    /// Aggressive spill-to-disk settings
    pub spill: bool,
    /// Divisor for the sampling interval
    pub sampling_speedup: u32,
    /// Routine cleanup interval
    pub cleanup_interval: Duration,
}

impl RemediationPlan {
    /// Plan for `tier`.
    ///
    /// Each tier includes everything below it. EMERGENCY halves the
    /// memory limit CRITICAL put in force.
    #[must_use]
    pub fn for_tier(tier: ResponseTier, original: &OriginalLimits, config: &RemediationConfig) -> Self {
        let mut plan = Self {
            connection_limit: original.max_connections,
            memory_limit_bytes: original.memory_limit_bytes,
            result_cap: None,
            queueing: false,
            rejecting: false,
            spill: false,
            sampling_speedup: 1,
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
        };

        if tier >= ResponseTier::Caution {
            plan.sampling_speedup = config.sampling_speedup.max(1);
            plan.cleanup_interval = Duration::from_millis(config.fast_cleanup_interval_ms);
        }
        if tier >= ResponseTier::Warning {
            plan.connection_limit = scale(original.max_connections, config.warning_connection_factor);
            plan.result_cap = Some(config.result_row_cap);
        }
        if tier >= ResponseTier::Critical {
            plan.connection_limit = scale(original.max_connections, config.critical_connection_factor);
            plan.memory_limit_bytes =
                (original.memory_limit_bytes as f64 * config.critical_memory_factor) as u64;
            plan.queueing = true;
        }
        if tier >= ResponseTier::Emergency {
            plan.memory_limit_bytes =
                (plan.memory_limit_bytes as f64 * config.emergency_memory_factor) as u64;
            plan.rejecting = true;
            plan.spill = true;
        }
        plan
    }
}

fn scale(value: u32, factor: f64) -> u32 {
    ((f64::from(value) * factor).floor() as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original() -> OriginalLimits {
        OriginalLimits {
            memory_limit_bytes: 1_000,
            max_connections: 10,
        }
    }

    #[test]
    fn normal_is_original() {
        let plan = RemediationPlan::for_tier(ResponseTier::Normal, &original(), &RemediationConfig::default());
        assert_eq!(plan.connection_limit, 10);
        assert_eq!(plan.memory_limit_bytes, 1_000);
        assert_eq!(plan.result_cap, None);
        assert_eq!(plan.sampling_speedup, 1);
    }

    #[test]
    fn tiers_are_additive() {
        let cfg = RemediationConfig::default();
        let caution = RemediationPlan::for_tier(ResponseTier::Caution, &original(), &cfg);
        assert_eq!(caution.sampling_speedup, 2);
        assert_eq!(caution.connection_limit, 10);

        let warning = RemediationPlan::for_tier(ResponseTier::Warning, &original(), &cfg);
        assert_eq!(warning.connection_limit, 7);
        assert_eq!(warning.result_cap, Some(10_000));
        assert_eq!(warning.sampling_speedup, 2);

        let critical = RemediationPlan::for_tier(ResponseTier::Critical, &original(), &cfg);
        assert_eq!(critical.connection_limit, 5);
        assert_eq!(critical.memory_limit_bytes, 800);
        assert!(critical.queueing);
        assert_eq!(critical.result_cap, Some(10_000));

        let emergency = RemediationPlan::for_tier(ResponseTier::Emergency, &original(), &cfg);
        assert_eq!(emergency.memory_limit_bytes, 400);
        assert_eq!(emergency.connection_limit, 5);
        assert!(emergency.rejecting && emergency.spill && emergency.queueing);
    }

    #[test]
    fn connection_limit_never_zero() {
        let tiny = OriginalLimits {
            memory_limit_bytes: 1_000,
            max_connections: 1,
        };
        let plan = RemediationPlan::for_tier(ResponseTier::Critical, &tiny, &RemediationConfig::default());
        assert_eq!(plan.connection_limit, 1);
    }
}
