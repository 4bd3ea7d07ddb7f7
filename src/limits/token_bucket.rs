//! The token bucket itself.
//!
//! The available budget grows by `rate` per second up to `ceil`. A request
//! is granted whatever is available, up to its cost; there is no queueing
//! at this level.

use std::time::Instant;

pub struct TokenBucket {
    rate: f64,
    budget: f64,
    ceil: f64,
    prev_time: Instant,
}

impl TokenBucket {
    pub fn new(now: Instant) -> Self {
        Self { rate: 0.0, budget: 0.0, ceil: 0.0, prev_time: now }
    }

    /// Update rate and ceiling. The budget accumulated so far is preserved
    /// (clamped to the new ceiling on the next update).
    pub fn reconfigure(&mut self, now: Instant, rate: f64, ceil: f64) {
        self.update_budget(now);
        self.rate = rate;
        self.ceil = ceil;
    }

    pub fn reconfigure_with_budget(&mut self, now: Instant, rate: f64, ceil: f64, budget: f64) {
        self.reconfigure(now, rate, ceil);
        self.budget = budget;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn ceil(&self) -> f64 {
        self.ceil
    }

    /// Try to satisfy a request of `cost` tokens. Returns the granted
    /// amount, between 0 and `cost`. Requires `cost > 0`.
    pub fn attempt(&mut self, now: Instant, cost: f64) -> f64 {
        assert!(cost > 0.0);
        self.update_budget(now);
        let result = cost.min(self.budget);
        self.budget -= result;
        result
    }

    fn update_budget(&mut self, now: Instant) {
        // the clock handed in must be monotonic
        assert!(now >= self.prev_time, "time went backward");
        let elapsed_ns = now.duration_since(self.prev_time).as_nanos() as f64;
        self.prev_time = now;
        self.budget += self.rate * elapsed_ns / 1e9;
        if self.budget > self.ceil {
            self.budget = self.ceil;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(t0: Instant, seconds: f64) -> Instant {
        t0 + Duration::from_secs_f64(seconds)
    }

    struct Case {
        time: f64,
        request: f64,
        result: f64,
    }

    fn run(rate: f64, ceil: f64, cases: &[Case]) {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(t0);
        bucket.reconfigure(t0, rate, ceil);
        for case in cases {
            assert_eq!(bucket.attempt(at(t0, case.time), case.request), case.result);
        }
    }

    #[test]
    fn nothing_at_the_beginning() {
        run(10.0, 5.0, &[Case { time: 0.0, request: 123.0, result: 0.0 }]);
    }

    #[test]
    fn partial_grant_after_short_wait() {
        run(10.0, 5.0, &[Case { time: 0.1, request: 2.0, result: 1.0 }]);
    }

    #[test]
    fn ceil_caps_the_grant() {
        run(10.0, 5.0, &[Case { time: 1.0, request: 10.0, result: 5.0 }]);
        run(10.0, 5.0, &[Case { time: 2.0, request: 10.0, result: 5.0 }]);
    }

    #[test]
    fn attempts_accumulate_properly() {
        run(
            10.0,
            5.0,
            &[
                Case { time: 0.1, request: 1.0, result: 1.0 },
                Case { time: 0.2, request: 1.0, result: 1.0 },
                Case { time: 0.25, request: 1.0, result: 0.5 },
                Case { time: 0.25, request: 1.0, result: 0.0 },
            ],
        );
    }

    #[test]
    fn reconfiguration_changes_rate_midway() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(t0);
        bucket.reconfigure(t0, 1.0, 10.0);
        assert_eq!(bucket.attempt(at(t0, 0.5), 10.0), 0.5);
        bucket.reconfigure(at(t0, 1.0), 2.0, 10.0);
        assert_eq!(bucket.attempt(at(t0, 2.0), 10.0), 2.5);
    }

    #[test]
    fn reconfiguration_reducing_ceil_clamps() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(t0);
        bucket.reconfigure(t0, 1.0, 10.0);
        bucket.reconfigure(at(t0, 20.0), 2.0, 5.0);
        assert_eq!(bucket.attempt(at(t0, 20.0), 10.0), 5.0);
    }

    #[test]
    #[should_panic(expected = "time went backward")]
    fn clock_must_be_steady() {
        let t0 = Instant::now() + Duration::from_secs(10);
        let mut bucket = TokenBucket::new(t0);
        bucket.reconfigure(t0 - Duration::from_secs(1), 10.0, 10.0);
    }
}
