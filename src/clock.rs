//! Time source for backends that track expiry themselves.
//!
//! Memory and file backends store an absolute `expire_at` (unix seconds,
//! `0` = never) and compare it against a [`Clock`] on every read.
//!
//! Deadlines round up to the next whole second, so an entry written with a
//! ttl of `n` seconds lives at least `n` seconds.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current unix time in seconds
    fn now(&self) -> u64;

    /// Current unix time in milliseconds
    fn now_millis(&self) -> u64 {
        self.now().saturating_mul(1_000)
    }

    /// Absolute expiry, in unix seconds, of an entry living `secs` from now
    fn deadline(&self, secs: u64) -> u64 {
        let millis = self
            .now_millis()
            .saturating_add(secs.saturating_mul(1_000));
        millis.div_ceil(1_000)
    }
}

/// Wall clock backed by `chrono::Utc`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.now_millis() / 1_000
    }

    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start` unix seconds
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicI64::new(start as i64),
        }
    }

    /// Create a clock starting at the current wall time
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Move time forward
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, now: u64) {
        self.now.store(now as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst).max(0) as u64
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The default wall clock as a shared handle
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// True when `expire_at` is set and has been reached.
#[inline]
pub fn is_expired(expire_at: u64, now: u64) -> bool {
    expire_at != 0 && now >= expire_at
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(5);
        assert_eq!(clock.now(), 1_005);
        clock.set(42);
        assert_eq!(clock.now(), 42);
    }

    #[test]
    fn test_zero_never_expires() {
        assert!(!is_expired(0, u64::MAX));
        assert!(!is_expired(10, 9));
        assert!(is_expired(10, 10));
        assert!(is_expired(10, 11));
    }

    #[derive(Debug)]
    struct FixedMillis(u64);

    impl Clock for FixedMillis {
        fn now(&self) -> u64 {
            self.0 / 1_000
        }

        fn now_millis(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_deadline_rounds_up_partial_seconds() {
        // written at x.990s with a one second ttl
        let late = FixedMillis(1_000_990);
        let deadline = late.deadline(1);
        assert_eq!(deadline, 1_002);
        assert!(!is_expired(deadline, FixedMillis(1_001_990).now()));
        assert!(is_expired(deadline, FixedMillis(1_002_000).now()));

        // whole seconds stay exact
        assert_eq!(FixedMillis(1_000_000).deadline(1), 1_001);
        assert_eq!(ManualClock::new(1_000).deadline(30), 1_030);
    }

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
