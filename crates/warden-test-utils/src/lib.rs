//! Testing utilities for the Warden workspace
//!
//! Shared test doubles and fixtures.

#![allow(missing_docs)]

mod engine;

pub use engine::{EngineCall, FakeEngine};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_core::error::EngineError;
use warden_core::notify::MemorySink;
use warden_core::{EngineSlot, MemoryProbe, NotificationManager, WardenConfig};

/// Memory probe with a settable reading
#[derive(Debug, Default)]
pub struct FakeMemoryProbe {
    used: AtomicU64,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeMemoryProbe {
    pub fn new(used: u64) -> Self {
        Self {
            used: AtomicU64::new(used),
            ..Self::default()
        }
    }

    pub fn set_used(&self, used: u64) {
        self.used.store(used, Ordering::SeqCst);
    }

    /// Set usage to `percent` of `limit`
    pub fn set_percent(&self, limit: u64, percent: f64) {
        self.set_used((limit as f64 * percent / 100.0).round() as u64);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

#[async_trait::async_trait]
impl MemoryProbe for FakeMemoryProbe {
    async fn used_bytes(&self) -> Result<u64, EngineError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::QueryFailed("probe failed".into()));
        }
        Ok(self.used.load(Ordering::SeqCst))
    }
}

/// Memory limit used by [`test_config`]; percentages map to whole bytes
pub const TEST_MEMORY_LIMIT: u64 = 1_000;

/// Configuration with a 1000-byte limit, 10 connections and no settle waits
pub fn test_config() -> WardenConfig {
    let mut config = WardenConfig::new()
        .with_memory_limit(TEST_MEMORY_LIMIT)
        .with_max_connections(10);
    config.sample_interval_ms = 1_000;
    config.cooldown_ms = 300_000;
    config.remediation.relief_settle_delay_ms = 0;
    config.remediation.queue_delay_ms = 0;
    config.recovery.backoff_base_ms = 10;
    config.recovery.health_check_timeout_ms = 1_000;
    config
}

/// Notification manager with an attached memory sink
pub fn capture_events() -> (Arc<NotificationManager>, Arc<MemorySink>) {
    let manager = Arc::new(NotificationManager::new(1_000));
    let sink = Arc::new(MemorySink::new());
    manager.add_sink(sink.clone());
    (manager, sink)
}

/// Engine slot holding `engine`
pub fn slot_for(engine: &Arc<FakeEngine>) -> EngineSlot {
    EngineSlot::new(engine.clone())
}
