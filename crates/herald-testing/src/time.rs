//! Deterministic time control for tests.
//!
//! [`TestClock`] implements the core [`Clock`] trait with manually advanced
//! virtual time: `sleep` advances the clock instead of waiting, `wall`
//! reports a virtual UTC timestamp, and `now` a virtual instant, so retry
//! ladders and backoff windows run instantly while still recording how much
//! time they would have consumed.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use herald_core::Clock;

/// Test clock with controllable wall and monotonic time.
#[derive(Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since clock creation.
    monotonic_ns: Arc<AtomicU64>,
    /// Wall time as seconds since `UNIX_EPOCH`.
    wall_secs: Arc<AtomicU64>,
    /// Base instant for monotonic calculations.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall time.
    pub fn new() -> Self {
        let since_epoch =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            wall_secs: Arc::new(AtomicU64::new(since_epoch.as_secs())),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0);
        self.monotonic_ns.fetch_add(nanos, Ordering::AcqRel);
        self.wall_secs.fetch_add(duration.as_secs(), Ordering::AcqRel);
    }

    /// Virtual time elapsed since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn wall(&self) -> DateTime<Utc> {
        let secs = self.wall_secs.load(Ordering::Acquire);
        DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
    }

    fn now(&self) -> Instant {
        let elapsed_ns = self.monotonic_ns.load(Ordering::Acquire);
        self.base_instant + Duration::from_nanos(elapsed_ns)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Sleeping advances virtual time; yield so other tasks can run.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::new();
        let start_instant = clock.now();
        let start_wall = clock.wall();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(start_instant), Duration::from_secs(90));
        assert_eq!(clock.wall() - start_wall, chrono::Duration::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::new();
        let wall_start = Instant::now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
        assert!(wall_start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn clones_share_state() {
        let clock = TestClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(other.elapsed(), Duration::from_secs(5));
    }
}
