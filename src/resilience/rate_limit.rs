//! Dual-bucket rate limiting per provider.
//!
//! Every provider bucket id owns two token buckets: one counting
//! requests, one counting estimated LLM tokens. An acquire succeeds only
//! when both buckets can pay at the same observation; otherwise the
//! caller waits on a fixed 100 ms cadence until refill or cancellation.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::resilience::token_bucket::TokenBucket;
use crate::types::RateLimitConfig;

/// Re-acquire cadence while waiting for tokens. Fixed: bounds release
/// propagation latency without busy-looping.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Server-reported rate limits, applied to the buckets on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// New requests-per-minute budget, when reported.
    pub requests_per_minute: Option<u32>,
    /// New LLM-tokens-per-minute budget, when reported.
    pub llm_tokens_per_minute: Option<u64>,
}

struct Buckets {
    requests: TokenBucket,
    llm_tokens: TokenBucket,
}

/// The pair of buckets for one bucket id.
///
/// Shared by reference (via `Arc`) across all operations targeting the
/// same provider; the single mutex makes the joint check-and-decrement
/// atomic.
pub struct RateLimitManager {
    name: String,
    buckets: Mutex<Buckets>,
}

impl RateLimitManager {
    /// Create a manager with both buckets full.
    ///
    /// Bucket capacity is the per-minute budget; refill runs at
    /// `budget / 60` tokens per second.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let rpm = config.requests_per_minute as u64;
        let tpm = config.llm_tokens_per_minute;
        Self {
            name: name.into(),
            buckets: Mutex::new(Buckets {
                requests: TokenBucket::new(rpm, rpm as f64 / 60.0),
                llm_tokens: TokenBucket::new(tpm, tpm as f64 / 60.0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attempt one joint withdrawal: one request token plus `llm_tokens`
    /// LLM tokens.
    ///
    /// Atomic: if the LLM-token withdrawal fails, the request token is
    /// refunded before the lock is released, so a failed acquire never
    /// leaves either bucket decreased.
    pub fn try_acquire(&self, llm_tokens: u64) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        if !buckets.requests.try_remove(1) {
            return false;
        }
        if !buckets.llm_tokens.try_remove(llm_tokens) {
            buckets.requests.deposit(1);
            return false;
        }
        true
    }

    /// Acquire both reservations, sleeping 100 ms between attempts.
    ///
    /// Returns [`LlmError::Cancelled`] immediately when `cancel` is
    /// already fired, or as soon as it fires during a sleep.
    pub async fn acquire(&self, llm_tokens: u64, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            if self.try_acquire(llm_tokens) {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(ACQUIRE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Apply server-reported limits to the underlying buckets.
    pub fn update(&self, info: &RateLimitInfo) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(rpm) = info.requests_per_minute {
            buckets.requests.update(rpm as u64, rpm as f64 / 60.0);
            debug!(bucket = %self.name, rpm, "applied server-reported request limit");
        }
        if let Some(tpm) = info.llm_tokens_per_minute {
            buckets.llm_tokens.update(tpm, tpm as f64 / 60.0);
            debug!(bucket = %self.name, tpm, "applied server-reported token limit");
        }
    }

    /// Current balances `(requests, llm_tokens)` for observability.
    pub fn snapshot(&self) -> (f64, f64) {
        let buckets = self.buckets.lock().unwrap();
        (buckets.requests.available(), buckets.llm_tokens.available())
    }
}

impl std::fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (requests, llm_tokens) = self.snapshot();
        f.debug_struct("RateLimitManager")
            .field("name", &self.name)
            .field("requests_available", &requests)
            .field("llm_tokens_available", &llm_tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rpm: u32, tpm: u64) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            llm_tokens_per_minute: tpm,
        }
    }

    #[test]
    fn test_acquire_decrements_both_buckets() {
        let manager = RateLimitManager::new("openai", config(10, 1000));
        assert!(manager.try_acquire(250));
        let (requests, llm_tokens) = manager.snapshot();
        assert_eq!(requests, 9.0);
        assert_eq!(llm_tokens, 750.0);
    }

    #[test]
    fn test_failed_acquire_refunds_request_token() {
        let manager = RateLimitManager::new("openai", config(10, 100));
        // More LLM tokens than the bucket holds: the request token taken
        // first must come back.
        assert!(!manager.try_acquire(500));
        let (requests, llm_tokens) = manager.snapshot();
        assert_eq!(requests, 10.0);
        assert_eq!(llm_tokens, 100.0);
    }

    #[test]
    fn test_acquire_fails_when_requests_exhausted() {
        let manager = RateLimitManager::new("openai", config(1, 1000));
        assert!(manager.try_acquire(10));
        assert!(!manager.try_acquire(10));
        let (_, llm_tokens) = manager.snapshot();
        // The LLM-token bucket must not have been touched by the failure.
        assert_eq!(llm_tokens, 990.0);
    }

    #[tokio::test]
    async fn test_acquire_returns_cancelled_before_first_attempt() {
        let manager = RateLimitManager::new("openai", config(10, 1000));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.acquire(1, &cancel).await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
        // Nothing withdrawn.
        let (requests, _) = manager.snapshot();
        assert_eq!(requests, 10.0);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_during_wait() {
        let manager = std::sync::Arc::new(RateLimitManager::new("openai", config(0, 0)));
        let cancel = CancellationToken::new();

        let waiter = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.acquire(1, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn test_acquire_succeeds_once_tokens_return() {
        let manager = std::sync::Arc::new(RateLimitManager::new("openai", config(1, 10)));
        assert!(manager.try_acquire(10));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                manager.acquire(1, &cancel).await
            })
        };

        // Re-parameterizing refills both buckets; the 100ms cadence picks
        // it up on the next attempt.
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.update(&RateLimitInfo {
            requests_per_minute: Some(5),
            llm_tokens_per_minute: Some(100),
        });

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("acquire should complete after update")
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_update_ignores_absent_fields() {
        let manager = RateLimitManager::new("openai", config(10, 1000));
        assert!(manager.try_acquire(100));
        manager.update(&RateLimitInfo {
            requests_per_minute: Some(20),
            llm_tokens_per_minute: None,
        });
        let (requests, llm_tokens) = manager.snapshot();
        assert_eq!(requests, 20.0);
        // The token bucket keeps its drained balance.
        assert_eq!(llm_tokens, 900.0);
    }
}
