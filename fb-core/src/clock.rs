//! Time source for the orchestrator
//!
//! Every wait in the unlock and write-verify sequences goes through a
//! `Clock`, so tests can fast-forward instead of sleeping.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send {
    /// Monotonic time since an arbitrary origin
    fn now(&self) -> Duration;

    fn sleep(&self, d: Duration);
}

/// Wall clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Deterministic clock; `sleep` advances time instantly.
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        *self.now.lock() += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_sleep_advances_shared_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.sleep(Duration::from_millis(300));
        other.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_millis(1300));
    }
}
