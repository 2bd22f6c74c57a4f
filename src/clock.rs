//! Monotonic time source used by cell age tracking and the commit worker.
//!
//! A pluggable clock keeps `commit_max_age`/`eviction_age` logic testable
//! without sleeping real time in unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic source of "now".
pub trait Clock: Send + Sync {
    /// Current time, as a duration since some fixed (implementation-defined)
    /// epoch. Only differences between two readings are meaningful.
    fn now(&self) -> Duration;
}

/// Wraps [`std::time::Instant`] for production use.
#[derive(Debug, Default)]
pub struct SystemClock {
    start: once_start::OnceInstant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.get().elapsed()
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed_millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        self.elapsed_millis
            .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.elapsed_millis.load(Ordering::SeqCst))
    }
}

/// Lazily-initialized process-start `Instant`, so `SystemClock::now()` stays
/// cheap (one atomic-free `Instant::elapsed` call) after first use.
mod once_start {
    use super::Instant;
    use std::sync::OnceLock;

    #[derive(Debug, Default)]
    pub struct OnceInstant(OnceLock<Instant>);

    impl OnceInstant {
        pub fn get(&self) -> &Instant {
            self.0.get_or_init(Instant::now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::from_millis(0));
        clock.advance(Duration::from_millis(50));
        clock.advance(Duration::from_millis(25));
        assert_eq!(clock.now(), Duration::from_millis(75));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a);
    }
}
