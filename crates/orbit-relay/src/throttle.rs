//! Token-bucket rate limiter.
//!
//! Quota accrues continuously at the configured rate and is capped at a
//! maximum burst. The scheduler checks quota before sending and consumes it
//! after a successful send, so a would-block never burns budget.

use std::time::Instant;

/// Byte (or item) token bucket.
#[derive(Debug)]
pub struct Throttle {
    rate: f64,
    max_quota: f64,
    quota: f64,
    last_refill: Instant,
}

impl Throttle {
    /// A bucket refilling at `rate` units per second, starting full for one
    /// second's worth.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            max_quota: rate,
            quota: rate,
            last_refill: Instant::now(),
        }
    }

    pub fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    pub fn set_max_quota(&mut self, max_quota: f64) {
        self.max_quota = max_quota;
        self.quota = self.quota.min(max_quota);
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.quota = (self.quota + elapsed * self.rate).min(self.max_quota);
        self.last_refill = now;
    }

    /// Whether `n` units are available right now.
    pub fn has_quota(&mut self, n: usize) -> bool {
        self.refill();
        self.quota >= n as f64
    }

    /// Currently available whole units.
    pub fn get_quota(&mut self) -> u64 {
        self.refill();
        self.quota.max(0.0) as u64
    }

    /// Consumes `n` units. Callers check first; overdraw is clamped.
    pub fn use_quota(&mut self, n: usize) {
        self.quota = (self.quota - n as f64).max(-self.max_quota);
    }

    /// Milliseconds until `n` units will be available.
    pub fn estimate_wait(&mut self, n: usize) -> u64 {
        self.refill();
        let deficit = n as f64 - self.quota;
        if deficit <= 0.0 || self.rate <= 0.0 {
            return 0;
        }
        (deficit / self.rate * 1000.0).ceil() as u64
    }
}
