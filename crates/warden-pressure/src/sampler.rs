//! Resource sampler
//!
//! Reads memory usage through a [`MemoryProbe`] and the in-flight operation
//! count through an [`ActiveOperationSource`]. A read is bounded by a short
//! timeout; when the probe is slow or fails, the last good reading is
//! replayed with its `stale` flag set so the tick loop never stalls.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_core::{MemoryProbe, PressureSample};

pub use warden_core::ActiveOperationSource;

/// Default bound on one probe read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Sampler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    /// Samples produced
    pub samples: u64,
    /// Samples that replayed an older reading
    pub stale: u64,
    /// Probe reads that hit the timeout
    pub timeouts: u64,
    /// Probe reads that returned an error
    pub errors: u64,
}

/// Periodic memory and load sampler
pub struct ResourceSampler {
    probe: Arc<dyn MemoryProbe>,
    operations: RwLock<Option<Arc<dyn ActiveOperationSource>>>,
    memory_limit_bytes: u64,
    read_timeout: Duration,
    base_interval: Duration,
    interval_ms: AtomicU64,
    last_good: Mutex<Option<PressureSample>>,
    samples: AtomicU64,
    stale: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl ResourceSampler {
    /// Sampler measuring against the configured memory limit
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>, memory_limit_bytes: u64, interval: Duration) -> Self {
        Self {
            probe,
            operations: RwLock::new(None),
            memory_limit_bytes,
            read_timeout: DEFAULT_READ_TIMEOUT,
            base_interval: interval,
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
            last_good: Mutex::new(None),
            samples: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// With a custom read timeout
    #[inline]
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Attach the source of the active-operation count
    pub fn set_operation_source(&self, source: Arc<dyn ActiveOperationSource>) {
        *self.operations.write() = Some(source);
    }

    /// Take one sample; completes within the read timeout
    pub async fn sample(&self) -> PressureSample {
        let now = Utc::now();
        let active = self
            .operations
            .read()
            .as_ref()
            .map_or(0, |source| source.active_count());
        self.samples.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.read_timeout, self.probe.used_bytes()).await {
            Ok(Ok(used)) => {
                let sample = PressureSample::new(now, used, self.memory_limit_bytes, active);
                *self.last_good.lock() = Some(sample);
                sample
            }
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "memory probe failed, replaying last reading");
                self.replay(now, active)
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "memory probe timed out, replaying last reading"
                );
                self.replay(now, active)
            }
        }
    }

    fn replay(&self, now: chrono::DateTime<Utc>, active: usize) -> PressureSample {
        self.stale.fetch_add(1, Ordering::Relaxed);
        let used = self.last_good.lock().map_or(0, |s| s.memory_used_bytes);
        PressureSample::new(now, used, self.memory_limit_bytes, active).into_stale()
    }

    /// Most recent successful reading
    #[must_use]
    pub fn last_good(&self) -> Option<PressureSample> {
        *self.last_good.lock()
    }

    /// Interval the tick loop should currently wait
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Divide the configured interval by `divisor`; 1 restores it
    pub fn set_speedup(&self, divisor: u32) {
        let ms = self.base_interval.as_millis() as u64 / u64::from(divisor.max(1));
        self.interval_ms.store(ms.max(1), Ordering::Relaxed);
    }

    /// Memory limit used as the usage denominator
    #[inline]
    #[must_use]
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            samples: self.samples.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ResourceSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSampler")
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("interval", &self.interval())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_test_utils::FakeMemoryProbe;

    struct Fixed(usize);

    impl ActiveOperationSource for Fixed {
        fn active_count(&self) -> usize {
            self.0
        }
    }

    #[tokio::test]
    async fn fresh_sample() {
        let probe = Arc::new(FakeMemoryProbe::new(720));
        let sampler = ResourceSampler::new(probe, 1_000, Duration::from_secs(15));
        sampler.set_operation_source(Arc::new(Fixed(3)));

        let s = sampler.sample().await;
        assert!(!s.stale);
        assert_eq!(s.active_operation_count, 3);
        assert!((s.usage_percent() - 72.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_replays_last_good() {
        let probe = Arc::new(FakeMemoryProbe::new(500));
        let sampler = ResourceSampler::new(probe.clone(), 1_000, Duration::from_secs(15));
        sampler.sample().await;

        probe.set_used(900);
        probe.set_delay(Some(Duration::from_secs(1)));
        let s = sampler.sample().await;

        assert!(s.stale);
        assert_eq!(s.memory_used_bytes, 500);
        assert_eq!(sampler.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn failing_probe_without_history_reports_zero() {
        let probe = Arc::new(FakeMemoryProbe::new(500));
        probe.set_failing(true);
        let sampler = ResourceSampler::new(probe, 1_000, Duration::from_secs(15));

        let s = sampler.sample().await;
        assert!(s.stale);
        assert_eq!(s.memory_used_bytes, 0);
        assert_eq!(sampler.stats(), SamplerStats { samples: 1, stale: 1, timeouts: 0, errors: 1 });
    }

    #[test]
    fn speedup_divides_interval() {
        let sampler = ResourceSampler::new(
            Arc::new(FakeMemoryProbe::new(0)),
            1_000,
            Duration::from_secs(15),
        );
        sampler.set_speedup(2);
        assert_eq!(sampler.interval(), Duration::from_millis(7_500));
        sampler.set_speedup(1);
        assert_eq!(sampler.interval(), Duration::from_secs(15));
    }
}
