//! Token-bucket rate-limiting primitive.
//!
//! Refills are coarsened to whole seconds: fractional elapsed time is
//! ignored until at least one full second has passed, which keeps the
//! arithmetic aligned with the per-minute budgets providers publish.

use std::time::Instant;

/// A single token bucket with on-the-fly re-parameterization.
///
/// The bucket itself is not synchronized; [`RateLimitManager`] holds its
/// pair of buckets behind one lock so joint observations are atomic.
///
/// [`RateLimitManager`]: crate::resilience::rate_limit::RateLimitManager
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    /// Try to withdraw `n` tokens, refilling first.
    ///
    /// Returns `false` without modifying the balance when fewer than `n`
    /// tokens are available.
    pub fn try_remove(&mut self, n: u64) -> bool {
        self.refill();
        if self.tokens >= n as f64 {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Replace capacity and refill rate, resetting the balance to the new
    /// capacity.
    ///
    /// Server-reported limits are treated as new ground truth rather than
    /// a delta, so the bucket starts full under the new parameters. This
    /// can briefly over-grant after a tighter limit is pushed.
    pub fn update(&mut self, capacity: u64, refill_per_second: f64) {
        self.capacity = capacity;
        self.refill_per_second = refill_per_second;
        self.tokens = capacity as f64;
        self.last_refill = Instant::now();
    }

    /// Return `n` tokens to the bucket, saturating at capacity.
    ///
    /// Used by the manager to roll back the request-bucket withdrawal
    /// when the joint acquire fails on the second bucket.
    pub(crate) fn deposit(&mut self, n: u64) {
        self.tokens = (self.tokens + n as f64).min(self.capacity as f64);
    }

    /// Current balance (post-refill observation is up to the caller).
    pub fn available(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let replenished = elapsed.floor() * self.refill_per_second;
            self.tokens = (self.tokens + replenished).min(self.capacity as f64);
            self.last_refill = Instant::now();
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_refill(&mut self, at: Instant) {
        self.last_refill = at;
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) {
        self.tokens = 0.0;
    }
}
