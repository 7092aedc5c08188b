//! Monotonic Clock
//!
//! The engine timestamps everything in whole monotonic seconds so the
//! health arithmetic stays integer-only. The trait exists so tests can
//! drive staleness and observation-window rules without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonic seconds.
pub trait Clock: Send + Sync {
    /// Seconds elapsed since the clock's epoch.
    fn now_secs(&self) -> u64;
}

/// Wall clock backed by `Instant`, epoch at construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            secs: AtomicU64::new(0),
        }
    }

    /// Advance the clock by `secs`.
    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}
