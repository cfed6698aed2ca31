//! Escalation policy
//!
//! Pure mapping from a pressure sample and the controller's current
//! position to the tier it should be in.
//!
//! Rules:
//! - Usage at or above the bypass threshold escalates immediately.
//! - Any other change, up or down, waits for the cooldown since the last
//!   transition to elapse.
//! - Stale samples never lower the tier.

use chrono::{DateTime, Utc};
use std::time::Duration;
use warden_core::{PressureSample, ResponseTier, ThresholdConfig, WardenConfig};

/// Threshold table plus cooldown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationPolicy {
    thresholds: ThresholdConfig,
    cooldown: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(ThresholdConfig::default(), Duration::from_secs(300))
    }
}

impl EscalationPolicy {
    /// Policy from explicit thresholds
    #[inline]
    #[must_use]
    pub fn new(thresholds: ThresholdConfig, cooldown: Duration) -> Self {
        Self {
            thresholds,
            cooldown,
        }
    }

    /// Policy from configuration
    #[inline]
    #[must_use]
    pub fn from_config(config: &WardenConfig) -> Self {
        Self::new(config.thresholds, config.cooldown())
    }

    /// Tier for a usage percentage, ignoring history
    #[must_use]
    pub fn tier_for(&self, usage_percent: f64) -> ResponseTier {
        let t = &self.thresholds;
        if usage_percent >= t.emergency {
            ResponseTier::Emergency
        } else if usage_percent >= t.critical {
            ResponseTier::Critical
        } else if usage_percent >= t.warning {
            ResponseTier::Warning
        } else if usage_percent >= t.caution {
            ResponseTier::Caution
        } else {
            ResponseTier::Normal
        }
    }

    /// Target tier for `sample` given the current tier and the time of the
    /// last transition (`None` when there has been none)
    #[must_use]
    pub fn evaluate(
        &self,
        sample: &PressureSample,
        current: ResponseTier,
        last_escalation: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ResponseTier {
        let usage = sample.usage_percent();
        let raw = self.tier_for(usage);
        let cooled = self.cooldown_elapsed(last_escalation, now);

        match raw.cmp(&current) {
            std::cmp::Ordering::Greater => {
                if usage >= self.thresholds.cooldown_bypass || cooled {
                    raw
                } else {
                    current
                }
            }
            std::cmp::Ordering::Less => {
                if !sample.stale && cooled {
                    raw
                } else {
                    current
                }
            }
            std::cmp::Ordering::Equal => current,
        }
    }

    /// Whether the cooldown since `last_escalation` has passed at `now`
    #[must_use]
    pub fn cooldown_elapsed(&self, last_escalation: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_escalation.map_or(true, |at| {
            (now - at).to_std().map_or(false, |elapsed| elapsed >= self.cooldown)
        })
    }

    /// Cooldown window
    #[inline]
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
