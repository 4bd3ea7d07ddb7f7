//! Monotonic clock abstraction.
//!
//! The limiter and the connection pool make timing decisions; tests drive
//! them with a manually advanced clock instead of sleeping.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep until `deadline` (cooperatively).
    fn sleep_until<'a>(
        &'a self,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// The real clock, backed by tokio timers.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until<'a>(
        &'a self,
        deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep_until(deadline.into()))
    }
}

/// Manually advanced clock for tests. `sleep_until` yields once so other
/// tasks can run, then returns immediately.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep_until<'a>(
        &'a self,
        _deadline: Instant,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async { tokio::task::yield_now().await })
    }
}

/// Measures time from creation or the last `reset`, and "expires" after a
/// predefined duration.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    start: Instant,
    timeout: Duration,
}

impl Timeout {
    pub fn new(timeout: Duration) -> Self {
        Self { start: Instant::now(), timeout }
    }

    pub fn with_start(start: Instant, timeout: Duration) -> Self {
        Self { start, timeout }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    pub fn reset_at(&mut self, now: Instant) {
        self.start = now;
    }

    pub fn deadline(&self) -> Instant {
        self.start + self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    pub fn expired_at(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - t0, Duration::from_secs(5));
    }

    #[test]
    fn timeout_expiry() {
        let now = Instant::now();
        let t = Timeout::with_start(now, Duration::from_millis(100));
        assert!(!t.expired_at(now));
        assert!(t.expired_at(now + Duration::from_millis(100)));
    }
}
