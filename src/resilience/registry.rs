//! Shared resilience state, owned explicitly.
//!
//! The per-bucket rate-limit managers, circuit breakers, and the
//! bulkhead live in a [`ResilienceRegistry`] value wired through
//! construction rather than a hidden global, so tests stay isolated and
//! one process can host independent instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::resilience::bulkhead::Bulkhead;
use crate::resilience::circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
use crate::resilience::rate_limit::RateLimitManager;
use crate::types::RateLimitConfig;

/// Directory of shared resilience primitives, keyed by bucket id.
///
/// Lookups create on first use; the configs passed in only apply at
/// creation, so all operations against one bucket share the instance
/// that was created first.
#[derive(Debug, Default)]
pub struct ResilienceRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimitManager>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bulkhead: Arc<Bulkhead>,
}

impl ResilienceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rate-limit manager for `bucket_id`, created with `config` on
    /// first use.
    pub fn limiter(&self, bucket_id: &str, config: RateLimitConfig) -> Arc<RateLimitManager> {
        self.limiters
            .lock()
            .unwrap()
            .entry(bucket_id.to_string())
            .or_insert_with(|| Arc::new(RateLimitManager::new(bucket_id, config)))
            .clone()
    }

    /// The circuit breaker for `bucket_id`, created with `config` on
    /// first use.
    pub fn breaker(&self, bucket_id: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .unwrap()
            .entry(bucket_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(bucket_id, config)))
            .clone()
    }

    /// The process-wide bulkhead shared by all buckets.
    pub fn bulkhead(&self) -> Arc<Bulkhead> {
        self.bulkhead.clone()
    }

    /// Snapshot a breaker without creating one.
    pub fn breaker_status(&self, bucket_id: &str) -> Option<BreakerStatus> {
        self.breakers
            .lock()
            .unwrap()
            .get(bucket_id)
            .map(|b| b.status())
    }
}
