//! Clock Abstraction
//!
//! Every time read in the pipeline goes through [`Clock`] so cursor
//! clamping and flush throttling can be driven deterministically in tests.
//!
//! Timestamps are Unix epoch microseconds, the unit the feed and the
//! cursor record both use.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds per minute, used by the rewind clamp.
pub const MICROS_PER_MINUTE: i64 = 60_000_000;

/// Clock trait for time operations
///
/// Implementations:
/// - `SystemClock`: real wall-clock time
/// - `SimulatedClock`: controlled virtual time for tests
pub trait Clock: Send + Sync + 'static {
    /// Current time in epoch microseconds
    fn now_us(&self) -> i64;

    /// Elapsed time since an earlier reading
    fn elapsed_since(&self, since_us: i64) -> Duration {
        let delta = self.now_us().saturating_sub(since_us).max(0);
        Duration::from_micros(delta as u64)
    }
}

/// Production clock anchored to the system time at construction
#[derive(Clone)]
pub struct SystemClock {
    start: Instant,
    start_us: i64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        let start_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_us,
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        // Monotonic after construction, even if the wall clock steps back.
        self.start_us + self.start.elapsed().as_micros() as i64
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone)]
pub struct SimulatedClock {
    time_us: Arc<AtomicI64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_us: i64) -> Self {
        SimulatedClock {
            time_us: Arc::new(AtomicI64::new(start_us)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_us
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, time_us: i64) {
        self.time_us.store(time_us, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_us(&self) -> i64 {
        self.time_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let t1 = clock.now_us();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now_us();

        assert!(t2 > t1, "Time should advance");
        assert!(t2 - t1 >= 5_000);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::new(1_000);
        let clone = clock.clone();

        assert_eq!(clock.now_us(), clone.now_us());
        clock.advance(Duration::from_millis(3));
        assert_eq!(clone.now_us(), 4_000, "Clones should share state");

        clock.set(50);
        assert_eq!(clone.now_us(), 50);
    }

    #[test]
    fn test_elapsed_since() {
        let clock = SimulatedClock::new(0);
        let start = clock.now_us();
        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.elapsed_since(start), Duration::from_secs(10));
        // Readings from the future saturate to zero.
        assert_eq!(clock.elapsed_since(start + 20_000_000), Duration::ZERO);
    }
}
