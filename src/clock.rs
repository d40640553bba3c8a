// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time source abstraction.
//!
//! Everything time-dependent in the engine (rate limiting, retry backoff,
//! staleness checks, gap clamping) reads time through a [`Clock`] so tests
//! can drive it deterministically.
//!
//! - [`TokioClock`] follows `tokio::time`, so it also works under
//!   `#[tokio::test(start_paused = true)]`.
//! - [`ManualClock`] never waits: `sleep` advances virtual time and returns.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for intervals and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time in epoch milliseconds, used for persisted timestamps.
    fn wall_millis(&self) -> i64;

    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the tokio timer and the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests and simulations.
///
/// Monotonic and wall time advance together, either explicitly through
/// [`ManualClock::advance`] or implicitly whenever someone sleeps.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
    wall_base: AtomicI64,
}

impl ManualClock {
    pub fn new(wall_millis: i64) -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
            wall_base: AtomicI64::new(wall_millis),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump the wall clock without touching monotonic time.
    pub fn set_wall_millis(&self, wall_millis: i64) {
        let elapsed = self.elapsed().as_millis() as i64;
        self.wall_base.store(wall_millis - elapsed, Ordering::SeqCst);
    }

    /// Virtual time elapsed since construction.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    fn wall_millis(&self) -> i64 {
        self.wall_base.load(Ordering::SeqCst) + self.elapsed().as_millis() as i64
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
