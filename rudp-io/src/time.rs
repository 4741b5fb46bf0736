//! Clocks and timers
//!
//! The engines read time as whole milliseconds through
//! [`rudp_protocol::Clock`]. [`MonotonicClock`] is the production clock;
//! [`ManualClock`] is stepped by hand in tests.

use rudp_protocol::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Milliseconds elapsed since the clock was created
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }

    /// Elapsed time since creation
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start_ms`
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Jump to `ms`
    ///
    /// # Panics
    /// Panics if `ms` is earlier than the current reading
    pub fn set(&self, ms: u64) {
        let prev = self.now_ms.swap(ms, Ordering::AcqRel);
        assert!(ms >= prev, "clock moved backwards: {prev} -> {ms}");
    }

    /// Move forward by `ms`, returning the new reading
    pub fn advance(&self, ms: u64) -> u64 {
        self.now_ms.fetch_add(ms, Ordering::AcqRel) + ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

/// Timer for periodic operations
///
/// Drives the retransmission scan and the delivery drain.
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer with the given interval
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.last_fire = Instant::now();
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self) -> Duration {
        self.interval.saturating_sub(self.last_fire.elapsed())
    }

    /// Sleep until the timer is due, then fire it
    pub fn wait(&mut self) {
        let remaining = self.time_until_expiration();
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        self.reset();
    }
}
