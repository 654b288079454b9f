//! Clock abstraction for the device session
//!
//! Window deadlines, delivery ticks, and retry bookkeeping all compare
//! against the same monotonic clock instance, so "tick time" and "deadline
//! time" can never drift apart. Wall-clock time (`chrono`) appears only on
//! message envelopes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Milliseconds on the session's monotonic timeline.
pub type Timestamp = u64;

/// Source of monotonic time for deadline math.
pub trait Clock: Send + Sync {
    /// Current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Monotonic clock anchored at session start.
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
    fn now(&self) -> Timestamp {
        self.start.elapsed().as_millis() as Timestamp
    }
}

/// Manually driven clock for tests.
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_ms: AtomicU64::new(start),
        }
    }

    pub fn set(&self, timestamp: Timestamp) {
        self.now_ms.store(timestamp, Ordering::Release);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now_ms.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now(), 1000);

        clock.advance(500);
        assert_eq!(clock.now(), 1500);

        clock.set(10_000);
        assert_eq!(clock.now(), 10_000);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
