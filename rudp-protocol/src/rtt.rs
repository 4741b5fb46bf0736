//! Connection RTT state
//!
//! One adaptive timeout estimate per connection, in milliseconds. Only the
//! send engine writes it; everything else reads through the shared
//! [`LinkHealth`] handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Default RTT estimate for a fresh connection (milliseconds)
pub const DEFAULT_RTT_MS: u64 = 100;

/// Lower bound for the RTT estimate (milliseconds)
pub const MIN_RTT_MS: u64 = 10;

/// Default backoff ceiling; growing past it declares the connection dead
pub const DEFAULT_TIMEOUT_CEILING_MS: u64 = 1000;

/// RTT value stored once the connection has timed out
pub const RTT_TIMED_OUT: u64 = u64::MAX;

/// Scale an RTT by the 1.5 safety/backoff factor, floored at `min_ms`
#[inline]
pub fn scale_rtt(rtt_ms: u64, min_ms: u64) -> u64 {
    (rtt_ms.saturating_mul(3) / 2).max(min_ms)
}

/// Shared RTT estimate and terminal timeout flag
#[derive(Debug)]
pub struct LinkHealth {
    rtt_ms: AtomicU64,
    final_rtt_ms: AtomicU64,
    timed_out: AtomicBool,
}

impl LinkHealth {
    /// Create link health with the given initial RTT estimate
    pub fn new(initial_rtt_ms: u64) -> Self {
        LinkHealth {
            rtt_ms: AtomicU64::new(initial_rtt_ms),
            final_rtt_ms: AtomicU64::new(0),
            timed_out: AtomicBool::new(false),
        }
    }

    /// Current RTT estimate, or [`RTT_TIMED_OUT`]
    #[inline]
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_rtt_ms(&self, rtt_ms: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::Release);
    }

    /// Whether the connection has been declared dead
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// RTT that pushed the connection over its ceiling (0 if still alive)
    pub fn final_rtt_ms(&self) -> u64 {
        self.final_rtt_ms.load(Ordering::Acquire)
    }

    pub(crate) fn mark_timed_out(&self, final_rtt_ms: u64) {
        self.final_rtt_ms.store(final_rtt_ms, Ordering::Relaxed);
        self.rtt_ms.store(RTT_TIMED_OUT, Ordering::Relaxed);
        self.timed_out.store(true, Ordering::Release);
    }

    pub(crate) fn revive(&self, initial_rtt_ms: u64) {
        self.final_rtt_ms.store(0, Ordering::Relaxed);
        self.rtt_ms.store(initial_rtt_ms, Ordering::Relaxed);
        self.timed_out.store(false, Ordering::Release);
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new(DEFAULT_RTT_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_rtt() {
        assert_eq!(scale_rtt(100, MIN_RTT_MS), 150);
        assert_eq!(scale_rtt(225, MIN_RTT_MS), 337);
        assert_eq!(scale_rtt(0, MIN_RTT_MS), MIN_RTT_MS);
        assert_eq!(scale_rtt(u64::MAX, MIN_RTT_MS), u64::MAX / 2);
    }

    #[test]
    fn test_timeout_lifecycle() {
        let health = LinkHealth::default();
        assert_eq!(health.rtt_ms(), DEFAULT_RTT_MS);
        assert!(!health.is_timed_out());

        health.mark_timed_out(1135);
        assert!(health.is_timed_out());
        assert_eq!(health.rtt_ms(), RTT_TIMED_OUT);
        assert_eq!(health.final_rtt_ms(), 1135);

        health.revive(DEFAULT_RTT_MS);
        assert!(!health.is_timed_out());
        assert_eq!(health.rtt_ms(), DEFAULT_RTT_MS);
    }
}
