//! Admission and maintenance gates
//!
//! Two independent gates sit in front of the engine:
//! - [`Admission`] refuses new work, either because pressure is at
//!   EMERGENCY or because fallback activation paused the local engine.
//! - [`MaintenanceLock`] lets crash recovery take the engine exclusively;
//!   remediation, sweeps and queries hold it shared.
//!
//! [`ActiveOperationSource`] lets the sampler and the fallback drain see
//! how much work is in flight.

use crate::error::WardenError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Anything that can count in-flight operations
pub trait ActiveOperationSource: Send + Sync {
    /// Operations currently running
    fn active_count(&self) -> usize;
}

/// Shared admission gate
#[derive(Debug, Default)]
pub struct Admission {
    rejecting: AtomicBool,
    paused: AtomicBool,
}

impl Admission {
    /// Gate that admits everything
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if new work must be refused
    pub fn check(&self) -> Result<(), WardenError> {
        if self.paused.load(Ordering::Acquire) {
            return Err(WardenError::AdmissionRejected(
                "local engine paused for fallback".into(),
            ));
        }
        if self.rejecting.load(Ordering::Acquire) {
            return Err(WardenError::AdmissionRejected(
                "rejecting new connections under emergency pressure".into(),
            ));
        }
        Ok(())
    }

    /// Pressure-driven rejection
    #[inline]
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::Release);
    }

    /// Fallback-driven pause
    #[inline]
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Whether pressure rejection is on
    #[inline]
    #[must_use]
    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::Acquire)
    }

    /// Whether the fallback pause is on
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Engine maintenance lock
#[derive(Debug, Clone, Default)]
pub struct MaintenanceLock {
    lock: Arc<RwLock<()>>,
    exclusive: Arc<AtomicBool>,
}

/// Exclusive maintenance access; cleared on drop
#[derive(Debug)]
pub struct MaintenanceGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    flag: &'a AtomicBool,
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl MaintenanceLock {
    /// Create an unlocked gate
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access, waiting out any maintenance in progress
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    /// Shared access if no maintenance is in progress
    #[must_use]
    pub fn try_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.in_maintenance() {
            return None;
        }
        self.lock.try_read().ok()
    }

    /// Exclusive access for recovery
    pub async fn exclusive(&self) -> MaintenanceGuard<'_> {
        let guard = self.lock.write().await;
        self.exclusive.store(true, Ordering::Release);
        MaintenanceGuard {
            _guard: guard,
            flag: &self.exclusive,
        }
    }

    /// Whether recovery currently owns the engine
    #[inline]
    #[must_use]
    pub fn in_maintenance(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }
}
