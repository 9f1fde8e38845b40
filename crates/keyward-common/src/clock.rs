//! Lease clock
//!
//! Claims and leases are timestamped in wall-clock milliseconds. Components
//! take the clock as `Arc<dyn LeaseClock>` so tests can substitute
//! [`ManualClock`] and run lease expiry and retry backoff without real delays.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait LeaseClock: Send + Sync {
    /// Current wall-clock time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, deadline_ms: i64) {
        let now = self.now_ms();
        if deadline_ms > now {
            self.sleep(Duration::from_millis((deadline_ms - now) as u64))
                .await;
        }
    }
}

/// Wall clock backed by chrono, sleeping on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> Arc<dyn LeaseClock> {
        Arc::new(SystemClock)
    }
}

#[async_trait]
impl LeaseClock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Deterministic clock. Time only moves through [`ManualClock::advance`] or
/// by sleeping, which jumps the clock forward instead of waiting.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn shared(start_ms: i64) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaseClock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    async fn sleep_until(&self, deadline_ms: i64) {
        self.now_ms.fetch_max(deadline_ms, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);

        clock.sleep_until(2_000).await;
        assert_eq!(clock.now_ms(), 2_000);

        // Deadlines in the past never move the clock backwards
        clock.sleep_until(1_500).await;
        assert_eq!(clock.now_ms(), 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep_until_past_deadline_returns() {
        let clock = SystemClock;
        let before = tokio::time::Instant::now();
        clock.sleep_until(clock.now_ms() - 10).await;
        assert_eq!(tokio::time::Instant::now(), before);
    }

    #[test]
    fn test_system_clock_is_wall_clock() {
        let now = SystemClock.now_ms();
        // 2020-01-01T00:00:00Z
        assert!(now > 1_577_836_800_000);
    }
}
