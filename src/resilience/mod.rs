//! Resilience primitives and the operation engine.
//!
//! Leaves first: [`TokenBucket`] feeds the [`RateLimitManager`];
//! [`CircuitBreaker`] and [`Bulkhead`] gate execution; the request
//! [`cache`] short-circuits it; [`ResilientOperation`] composes them all
//! around a transport call. Shared state lives in the
//! [`ResilienceRegistry`].
//!
//! [`TokenBucket`]: token_bucket::TokenBucket
//! [`RateLimitManager`]: rate_limit::RateLimitManager
//! [`CircuitBreaker`]: circuit_breaker::CircuitBreaker
//! [`Bulkhead`]: bulkhead::Bulkhead
//! [`ResilientOperation`]: operation::ResilientOperation
//! [`ResilienceRegistry`]: registry::ResilienceRegistry

pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod operation;
pub mod rate_limit;
pub mod registry;
pub mod token_bucket;

pub use bulkhead::{Bulkhead, BulkheadGuard};
pub use cache::{cache_key, CacheStore, CachedResponse, MemoryCacheStore};
pub use circuit_breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
pub use operation::{
    BackoffPolicy, JitterPolicy, OperationConfig, OperationPatch, RateLimitObserver,
    ResilientOperation,
};
pub use rate_limit::{RateLimitInfo, RateLimitManager};
pub use registry::ResilienceRegistry;
pub use token_bucket::TokenBucket;
