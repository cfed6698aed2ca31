//! Append-only audit log
//!
//! Every tier transition, recovery attempt, fallback change and rollback
//! outcome is appended here. Entries are SHA-256 chained so that a
//! retained window can be checked for tampering, and each append is also
//! emitted as a `tracing` event on target `warden::audit` with a stable
//! `operation` field.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Audited operation kinds; names are stable for downstream queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// Controller moved between tiers
    TierTransition,
    /// Emergency relief protocol ran
    EmergencyRelief,
    /// Hung operation was handled
    HungOperation,
    /// One crash-recovery attempt finished
    RecoveryAttempt,
    /// Crash recovery finished overall
    RecoveryCompleted,
    /// Fallback session started
    FallbackActivated,
    /// Fallback session ended
    FallbackDeactivated,
    /// Multi-step operation rolled back
    OperationRollback,
    /// Deployed unit rolled back
    UnitRollback,
}

impl AuditOperation {
    /// Stable field value
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TierTransition => "tier_transition",
            Self::EmergencyRelief => "emergency_relief",
            Self::HungOperation => "hung_operation",
            Self::RecoveryAttempt => "recovery_attempt",
            Self::RecoveryCompleted => "recovery_completed",
            Self::FallbackActivated => "fallback_activated",
            Self::FallbackDeactivated => "fallback_deactivated",
            Self::OperationRollback => "operation_rollback",
            Self::UnitRollback => "unit_rollback",
        }
    }
}

/// Outcome recorded with an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Completed as intended
    Success,
    /// Completed with some unresolved parts
    Partial,
    /// Did not achieve its goal
    Failure,
}

impl AuditOutcome {
    /// Stable field value
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }

    /// Success when `ok`, failure otherwise
    #[inline]
    #[must_use]
    pub const fn from_success(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence number
    pub sequence: u64,
    /// Append time
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub operation: AuditOperation,
    /// How it ended
    pub outcome: AuditOutcome,
    /// Free-form structured detail
    pub detail: serde_json::Value,
    /// Hash of the previous entry, hex
    pub prev_hash: String,
    /// Hash of this entry, hex
    pub hash: String,
}

/// Audit chain verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("audit chain broken at sequence {sequence}")]
pub struct AuditIntegrityError {
    /// First entry that failed verification
    pub sequence: u64,
}

#[derive(Debug)]
struct AuditState {
    events: VecDeque<AuditEvent>,
    last_hash: [u8; 32],
    next_sequence: u64,
}

/// Bounded, hash-chained audit log
#[derive(Debug)]
pub struct AuditLog {
    inner: Mutex<AuditState>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl AuditLog {
    /// Log keeping at most `capacity` entries in memory
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(AuditState {
                events: VecDeque::new(),
                last_hash: [0u8; 32],
                next_sequence: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry and emit it to `tracing`
    pub fn append(
        &self,
        operation: AuditOperation,
        outcome: AuditOutcome,
        detail: serde_json::Value,
    ) -> AuditEvent {
        let mut guard = self.inner.lock();
        let sequence = guard.next_sequence;
        let timestamp = Utc::now();
        let prev = guard.last_hash;
        let hash = compute_hash(sequence, timestamp, operation, outcome, &detail, &prev);

        let event = AuditEvent {
            sequence,
            timestamp,
            operation,
            outcome,
            detail,
            prev_hash: hex::encode(prev),
            hash: hex::encode(hash),
        };

        guard.next_sequence += 1;
        guard.last_hash = hash;
        guard.events.push_back(event.clone());
        while guard.events.len() > self.capacity {
            guard.events.pop_front();
        }
        drop(guard);

        tracing::info!(
            target: "warden::audit",
            operation = operation.as_str(),
            outcome = outcome.as_str(),
            sequence,
            detail = %event.detail,
            "audit"
        );
        event
    }

    /// Retained entries, oldest first
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Retained entries of one kind
    #[must_use]
    pub fn events_for(&self, operation: AuditOperation) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-hash the retained window; returns the number of entries checked
    pub fn verify_integrity(&self) -> Result<usize, AuditIntegrityError> {
        let guard = self.inner.lock();
        let mut expected_prev: Option<String> = None;
        for e in &guard.events {
            if let Some(prev) = &expected_prev {
                if &e.prev_hash != prev {
                    return Err(AuditIntegrityError { sequence: e.sequence });
                }
            }
            let mut prev_bytes = [0u8; 32];
            hex::decode_to_slice(&e.prev_hash, &mut prev_bytes)
                .map_err(|_| AuditIntegrityError { sequence: e.sequence })?;
            let recomputed = compute_hash(
                e.sequence,
                e.timestamp,
                e.operation,
                e.outcome,
                &e.detail,
                &prev_bytes,
            );
            if hex::encode(recomputed) != e.hash {
                return Err(AuditIntegrityError { sequence: e.sequence });
            }
            expected_prev = Some(e.hash.clone());
        }
        Ok(guard.events.len())
    }

    #[cfg(test)]
    fn tamper(&self, index: usize, detail: serde_json::Value) {
        self.inner.lock().events[index].detail = detail;
    }
}

fn compute_hash(
    sequence: u64,
    timestamp: DateTime<Utc>,
    operation: AuditOperation,
    outcome: AuditOutcome,
    detail: &serde_json::Value,
    prev: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(timestamp.timestamp_micros().to_le_bytes());
    hasher.update(operation.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(outcome.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(detail.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(prev);
    hasher.finalize().into()
}
