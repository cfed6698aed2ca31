//! Core types for Warden
//!
//! Defines the fundamental values exchanged between components:
//! - Pressure samples and response tiers
//! - Operation and connection identifiers
//! - Operation classes with their timeout budgets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Identifier of a tracked or rolled-back operation.
///
/// Callers may supply their own identifiers; [`OperationId::generate`]
/// produces a sortable ULID when they don't.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl OperationId {
    /// Wrap an existing identifier
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Engine connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One reading of engine memory and load.
///
/// Usage is always `memory_used_bytes / memory_limit_bytes`, where the limit
/// is the configured (original) engine memory limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    /// When the reading was taken
    pub timestamp: DateTime<Utc>,
    /// Bytes in use
    pub memory_used_bytes: u64,
    /// Denominator for the usage percentage
    pub memory_limit_bytes: u64,
    /// In-flight tracked operations
    pub active_operation_count: usize,
    /// Reading is a replay of the last good one after a probe failure
    pub stale: bool,
}

impl PressureSample {
    /// Create a fresh (non-stale) sample
    #[inline]
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        memory_used_bytes: u64,
        memory_limit_bytes: u64,
        active_operation_count: usize,
    ) -> Self {
        Self {
            timestamp,
            memory_used_bytes,
            memory_limit_bytes,
            active_operation_count,
            stale: false,
        }
    }

    /// Memory usage as a percentage of the limit.
    ///
    /// A zero limit means "unbounded" and reports 0.
    #[inline]
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_limit_bytes as f64 * 100.0
    }

    /// Mark the sample as stale
    #[inline]
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

/// Discrete remediation level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseTier {
    /// No remediation
    #[default]
    Normal,
    /// Watch more closely
    Caution,
    /// Cooperative cleanup and throttling
    Warning,
    /// Aggressive cleanup, queueing, reduced memory
    Critical,
    /// Emergency relief protocol
    Emergency,
}

impl ResponseTier {
    /// All tiers in ascending order
    pub const ALL: [ResponseTier; 5] = [
        ResponseTier::Normal,
        ResponseTier::Caution,
        ResponseTier::Warning,
        ResponseTier::Critical,
        ResponseTier::Emergency,
    ];

    /// Numeric level 0-4
    #[inline]
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            ResponseTier::Normal => 0,
            ResponseTier::Caution => 1,
            ResponseTier::Warning => 2,
            ResponseTier::Critical => 3,
            ResponseTier::Emergency => 4,
        }
    }

    /// Inverse of [`ResponseTier::value`]; out-of-range values saturate at EMERGENCY
    #[inline]
    #[must_use]
    pub const fn from_value(value: u8) -> Self {
        match value {
            0 => ResponseTier::Normal,
            1 => ResponseTier::Caution,
            2 => ResponseTier::Warning,
            3 => ResponseTier::Critical,
            _ => ResponseTier::Emergency,
        }
    }

    /// Next tier down, NORMAL stays NORMAL
    #[inline]
    #[must_use]
    pub const fn lower(self) -> Self {
        match self {
            ResponseTier::Normal | ResponseTier::Caution => ResponseTier::Normal,
            ResponseTier::Warning => ResponseTier::Caution,
            ResponseTier::Critical => ResponseTier::Warning,
            ResponseTier::Emergency => ResponseTier::Critical,
        }
    }

    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ResponseTier::Normal => "normal",
            ResponseTier::Caution => "caution",
            ResponseTier::Warning => "warning",
            ResponseTier::Critical => "critical",
            ResponseTier::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for ResponseTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "0" => Ok(ResponseTier::Normal),
            "caution" | "1" => Ok(ResponseTier::Caution),
            "warning" | "2" => Ok(ResponseTier::Warning),
            "critical" | "3" => Ok(ResponseTier::Critical),
            "emergency" | "4" => Ok(ResponseTier::Emergency),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Operation class, selects the timeout budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Point queries and lookups
    Simple,
    /// Analytical queries
    Complex,
    /// Loads, exports, rebuilds
    Bulk,
}

impl OperationClass {
    /// Built-in timeout budget
    #[inline]
    #[must_use]
    pub const fn default_budget(self) -> Duration {
        match self {
            OperationClass::Simple => Duration::from_secs(30),
            OperationClass::Complex => Duration::from_secs(300),
            OperationClass::Bulk => Duration::from_secs(1800),
        }
    }

    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            OperationClass::Simple => "simple",
            OperationClass::Complex => "complex",
            OperationClass::Bulk => "bulk",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation currently in flight against the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOperation {
    /// Operation identifier
    pub id: OperationId,
    /// Budget class
    pub class: OperationClass,
    /// When it started
    pub start_time: DateTime<Utc>,
    /// Owning connection
    pub connection_id: ConnectionId,
}

impl TrackedOperation {
    /// Age of the operation at `now`, clamped at zero
    #[inline]
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.start_time).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_percent_uses_limit() {
        let s = PressureSample::new(Utc::now(), 720, 1000, 0);
        assert!((s.usage_percent() - 72.0).abs() < f64::EPSILON);
    }

    #[test]
    fn usage_percent_zero_limit() {
        let s = PressureSample::new(Utc::now(), 720, 0, 0);
        assert_eq!(s.usage_percent(), 0.0);
    }

    #[test]
    fn tier_ordering_and_values() {
        assert!(ResponseTier::Emergency > ResponseTier::Critical);
        assert!(ResponseTier::Caution > ResponseTier::Normal);
        for tier in ResponseTier::ALL {
            assert_eq!(ResponseTier::from_value(tier.value()), tier);
        }
        assert_eq!(ResponseTier::Emergency.lower(), ResponseTier::Critical);
        assert_eq!(ResponseTier::Normal.lower(), ResponseTier::Normal);
    }

    #[test]
    fn tier_parses_names_and_numbers() {
        assert_eq!("WARNING".parse::<ResponseTier>().unwrap(), ResponseTier::Warning);
        assert_eq!("4".parse::<ResponseTier>().unwrap(), ResponseTier::Emergency);
        assert!("panic".parse::<ResponseTier>().is_err());
    }

    #[test]
    fn tier_serializes_screaming() {
        let json = serde_json::to_string(&ResponseTier::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
    }

    #[test]
    fn operation_age_clamps_future_start() {
        let now = Utc::now();
        let op = TrackedOperation {
            id: OperationId::generate(),
            class: OperationClass::Simple,
            start_time: now + chrono::Duration::seconds(5),
            connection_id: ConnectionId(1),
        };
        assert_eq!(op.age(now), Duration::ZERO);
    }
}
