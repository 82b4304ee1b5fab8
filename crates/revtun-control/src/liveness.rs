//! Read-idle detection for control connections
//!
//! Each idle window that passes without an inbound frame counts as a miss.
//! Any inbound frame (KEEPALIVE included) resets the count; once the count
//! exceeds the retry limit the connection is evicted.

use crate::config::SessionConfig;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// What to do after an idle window elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Allow another window
    Wait { misses: u32 },
    /// Retry limit exceeded
    Evict { misses: u32 },
}

#[derive(Debug)]
pub struct LivenessMonitor {
    idle_window: Duration,
    retry_limit: u32,
    misses: AtomicU32,
}

impl LivenessMonitor {
    pub fn new(idle_window: Duration, retry_limit: u32) -> Self {
        Self {
            idle_window,
            retry_limit,
            misses: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.idle_window, config.idle_retry_limit)
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn misses(&self) -> u32 {
        self.misses.load(Ordering::Acquire)
    }

    pub fn record_activity(&self) {
        self.misses.store(0, Ordering::Release);
    }

    /// Count one elapsed idle window.
    ///
    /// Evicts on miss `retry_limit + 1`. Every frame starts a fresh window, so a
    /// silent client is dropped `retry_limit + 1` windows after its last frame.
    pub fn on_read_idle(&self) -> IdleVerdict {
        let misses = self.misses.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        if misses > self.retry_limit {
            IdleVerdict::Evict { misses }
        } else {
            IdleVerdict::Wait { misses }
        }
    }

    /// Await `read`, giving up after one idle window.
    ///
    /// `None` means the window elapsed with nothing read.
    pub async fn read_or_idle<F>(&self, read: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::time::timeout(self.idle_window, read).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_up_to_limit_then_evicts() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);

        for expected in 1..=5 {
            assert_eq!(
                monitor.on_read_idle(),
                IdleVerdict::Wait { misses: expected }
            );
        }
        assert_eq!(monitor.on_read_idle(), IdleVerdict::Evict { misses: 6 });
    }

    #[test]
    fn test_activity_resets_to_zero() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 5);
        monitor.on_read_idle();
        monitor.on_read_idle();
        monitor.on_read_idle();
        assert_eq!(monitor.misses(), 3);

        monitor.record_activity();
        assert_eq!(monitor.misses(), 0);
        assert_eq!(monitor.on_read_idle(), IdleVerdict::Wait { misses: 1 });
    }

    #[test]
    fn test_zero_limit_evicts_on_first_miss() {
        let monitor = LivenessMonitor::new(Duration::from_secs(1), 0);
        assert_eq!(monitor.on_read_idle(), IdleVerdict::Evict { misses: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_or_idle_times_out() {
        let monitor = LivenessMonitor::new(Duration::from_secs(30), 5);
        let result = monitor.read_or_idle(std::future::pending::<()>()).await;
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_or_idle_returns_ready_value() {
        let monitor = LivenessMonitor::new(Duration::from_secs(30), 5);
        let result = monitor.read_or_idle(async { 7 }).await;
        assert_eq!(result, Some(7));
    }
}
