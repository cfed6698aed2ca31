//! FIFO query queue
//!
//! At CRITICAL, queries run one at a time in arrival order with a fixed
//! pause between them. `tokio::sync::Mutex` hands out its lock in FIFO
//! order, which gives the ordering for free.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Serializing gate in front of query execution
#[derive(Debug)]
pub struct QueryQueue {
    enabled: AtomicBool,
    delay_ms: AtomicU64,
    slot: Arc<Mutex<Option<Instant>>>,
    waiting: AtomicUsize,
}

/// Held while a queued query runs
#[derive(Debug)]
pub struct QueuePermit {
    guard: Option<OwnedMutexGuard<Option<Instant>>>,
}

impl QueuePermit {
    /// Whether the query went through the queue
    #[inline]
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = Some(Instant::now());
        }
    }
}

impl QueryQueue {
    /// Disabled queue with the given inter-query delay
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            slot: Arc::new(Mutex::new(None)),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Turn serialization on or off
    #[inline]
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether serialization is on
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Queries waiting for their turn
    #[inline]
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Wait for this query's turn; immediate when the queue is off
    pub async fn enter(&self) -> QueuePermit {
        if !self.is_enabled() {
            return QueuePermit { guard: None };
        }
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let guard = Arc::clone(&self.slot).lock_owned().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        if let Some(finished) = *guard {
            let delay = Duration::from_millis(self.delay_ms.load(Ordering::Relaxed));
            tokio::time::sleep_until(finished + delay).await;
        }
        QueuePermit { guard: Some(guard) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_queue_is_passthrough() {
        let queue = QueryQueue::new(Duration::from_millis(100));
        let a = queue.enter().await;
        let b = queue.enter().await;
        assert!(!a.is_queued() && !b.is_queued());
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_queue_spaces_queries() {
        let queue = Arc::new(QueryQueue::new(Duration::from_millis(100)));
        queue.set_enabled(true);

        let start = Instant::now();
        drop(queue.enter().await);
        let second = queue.enter().await;
        assert!(second.is_queued());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_arrival_order() {
        let queue = Arc::new(QueryQueue::new(Duration::from_millis(10)));
        queue.set_enabled(true);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let first = queue.enter().await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let q = Arc::clone(&queue);
            let o = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = q.enter().await;
                o.lock().push(i);
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.waiting(), 3);
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
