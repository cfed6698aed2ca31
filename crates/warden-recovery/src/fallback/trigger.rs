//! Fallback activation predicate
//!
//! [`OperationStats`] is fed by the protected execution path; the trigger
//! combines it with the relief outcome and engine availability.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use warden_core::CloudFallbackConfig;

/// Why fallback was activated
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackReason {
    /// Usage stayed above the ceiling after emergency relief
    SustainedMemoryPressure {
        /// Usage after relief
        usage_percent: f64,
    },
    /// Average latency over the window exceeded the threshold
    HighLatency {
        /// Window average
        average_ms: u64,
    },
    /// Too many failures in a row
    ConsecutiveFailures {
        /// Failures in a row
        count: u32,
    },
    /// Engine down and recovery exhausted
    EngineUnavailable {
        /// Last error
        detail: String,
    },
    /// Operator request
    Manual {
        /// Free-form reason
        detail: String,
    },
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SustainedMemoryPressure { usage_percent } => {
                write!(f, "memory at {usage_percent:.1}% after emergency relief")
            }
            Self::HighLatency { average_ms } => write!(f, "average latency {average_ms}ms"),
            Self::ConsecutiveFailures { count } => write!(f, "{count} consecutive failures"),
            Self::EngineUnavailable { detail } => write!(f, "engine unavailable: {detail}"),
            Self::Manual { detail } => write!(f, "manual: {detail}"),
        }
    }
}

/// Rolling statistics of protected operations
#[derive(Debug)]
pub struct OperationStats {
    window: usize,
    latencies: Mutex<VecDeque<Duration>>,
    consecutive_failures: AtomicU32,
    total: AtomicU64,
    failed: AtomicU64,
}

impl OperationStats {
    /// Stats averaging over the last `window` operations
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            latencies: Mutex::new(VecDeque::new()),
            consecutive_failures: AtomicU32::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Record a successful operation
    pub fn record_success(&self, latency: Duration) {
        self.push(latency);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed operation
    pub fn record_failure(&self, latency: Duration) {
        self.push(latency);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn push(&self, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut window = self.latencies.lock();
        window.push_back(latency);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    /// Average latency once the window is full
    #[must_use]
    pub fn sustained_average(&self) -> Option<Duration> {
        let window = self.latencies.lock();
        if window.len() < self.window {
            return None;
        }
        let sum: Duration = window.iter().sum();
        Some(sum / window.len() as u32)
    }

    /// Failures in a row
    #[inline]
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Operations recorded and how many failed
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        (self.total.load(Ordering::Relaxed), self.failed.load(Ordering::Relaxed))
    }

    /// Forget everything
    pub fn reset(&self) {
        self.latencies.lock().clear();
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }
}

/// Signals the trigger looks at
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerInputs {
    /// Usage measured after the last emergency relief, if it failed
    pub usage_after_relief: Option<f64>,
    /// Sustained average latency
    pub average_latency: Option<Duration>,
    /// Failures in a row
    pub consecutive_failures: u32,
    /// Engine unavailable after exhausted recovery
    pub engine_unavailable: Option<String>,
}

/// Activation predicate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackTrigger {
    sustained_memory_percent: f64,
    latency_threshold: Duration,
    failure_threshold: u32,
}

impl FallbackTrigger {
    /// Trigger from configuration
    #[must_use]
    pub fn from_config(config: &CloudFallbackConfig) -> Self {
        Self {
            sustained_memory_percent: config.sustained_memory_percent,
            latency_threshold: config.latency_threshold(),
            failure_threshold: config.consecutive_failure_threshold.max(1),
        }
    }

    /// First condition that holds, if any
    #[must_use]
    pub fn evaluate(&self, inputs: &TriggerInputs) -> Option<FallbackReason> {
        if let Some(detail) = &inputs.engine_unavailable {
            return Some(FallbackReason::EngineUnavailable {
                detail: detail.clone(),
            });
        }
        if let Some(usage) = inputs.usage_after_relief {
            if usage > self.sustained_memory_percent {
                return Some(FallbackReason::SustainedMemoryPressure { usage_percent: usage });
            }
        }
        if inputs.consecutive_failures >= self.failure_threshold {
            return Some(FallbackReason::ConsecutiveFailures {
                count: inputs.consecutive_failures,
            });
        }
        match inputs.average_latency {
            Some(avg) if avg > self.latency_threshold => Some(FallbackReason::HighLatency {
                average_ms: avg.as_millis() as u64,
            }),
            _ => None,
        }
    }
}
