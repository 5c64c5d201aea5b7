//! Time sources for retry stamping and backoff sleeps.
//!
//! Everything time-dependent in the gateway flows through one trait:
//! `retry_at` hints and backoff windows are stamped from [`Clock::wall`],
//! client-cache idle tracking measures against [`Clock::now`], and retry
//! ladders pause through [`Clock::sleep`]. Injecting the source keeps all
//! three paths deterministic under test.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of wall-clock timestamps, monotonic instants, and sleeps.
///
/// Production code uses [`SystemClock`]; tests inject implementations
/// that advance virtual time instead of sleeping.
pub trait Clock: Send + Sync {
    /// Wall-clock time, as stamped into `retry_at` hints and compared
    /// against backoff windows.
    fn wall(&self) -> DateTime<Utc>;

    /// Monotonic instant for idle-time and duration measurements.
    fn now(&self) -> Instant;

    /// Pauses between retry attempts.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the operating system and tokio's async sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}
