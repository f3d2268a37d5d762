//! The resilient operation engine.
//!
//! One [`ResilientOperation`] executes one logical HTTP call against a
//! bucket id, composing every resilience concern around the transport:
//!
//! ```text
//! execute ──► bulkhead slot ──► cache lookup ──► deadline race
//!                                                    │
//!                         ┌──────────────────────────┘
//!                         ▼
//!                 loop: breaker gate ──► cancel gate ──► rate-limit acquire
//!                       ──► transport call ──► classify
//!                             success: breaker reset, cache write, return
//!                             failure: breaker vote, backoff or Retry-After,
//!                                      retry while budget remains
//! ```
//!
//! The rate-limit manager, breaker, and bulkhead are shared by reference
//! with every other operation on the same bucket; backoff state is
//! per-operation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LlmError, Result};
use crate::http::{provider_message, HttpRequest, HttpResponse, HttpTransport};
use crate::resilience::bulkhead::Bulkhead;
use crate::resilience::cache::{cache_key, CacheStore, CachedResponse};
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::resilience::rate_limit::{RateLimitInfo, RateLimitManager};
use crate::resilience::registry::ResilienceRegistry;
use crate::types::RateLimitConfig;

/// Callback invoked when server-reported rate limits are applied.
pub type RateLimitObserver = Arc<dyn Fn(&RateLimitInfo) + Send + Sync>;

/// Jitter applied to computed backoff delays (never to `Retry-After`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterPolicy {
    /// No jitter; delays are exactly the computed value. The default, so
    /// retry timing stays deterministic.
    #[default]
    None,
    /// Random delay in `[0, computed]`.
    Full,
    /// `computed/2` plus random in `[0, computed/2]`.
    Equal,
}

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry. Default: 1 second.
    pub initial_delay: Duration,
    /// Multiplier applied after each retry. At least 1. Default: 2.0.
    pub factor: f64,
    /// Ceiling on the computed delay. Default: 60 seconds.
    pub max_delay: Duration,
    /// Jitter strategy. Default: [`JitterPolicy::None`].
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// The delay following `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.factor.max(1.0);
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }

    /// Apply the jitter policy to a computed delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let base = delay.as_secs_f64();
        let jittered = match self.jitter {
            JitterPolicy::None => base,
            JitterPolicy::Full => fastrand::f64() * base,
            JitterPolicy::Equal => base / 2.0 + fastrand::f64() * (base / 2.0),
        };
        Duration::from_secs_f64(jittered)
    }
}

/// Configuration for one resilient operation. Immutable once execution
/// starts.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// Identifier under which buckets, breaker, and bulkhead counts are
    /// shared — typically the provider id.
    pub bucket_id: String,
    /// Budgets for the bucket's rate-limit manager (first use only).
    pub rate_limit: RateLimitConfig,
    /// Retry budget; the transport runs at most `retries + 1` times.
    pub retries: u32,
    /// Whole-operation deadline.
    pub timeout: Duration,
    /// Backoff between retries.
    pub backoff: BackoffPolicy,
    /// Breaker parameters for the bucket (first use only).
    pub breaker: BreakerConfig,
    /// In-flight ceiling for the bucket; `None` disables the bulkhead.
    pub max_concurrent: Option<usize>,
}

impl OperationConfig {
    /// Sensible cloud-API defaults: 3 retries, 60 s deadline, 1 s/2x
    /// backoff.
    pub fn new(bucket_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            rate_limit: RateLimitConfig::default(),
            retries: 3,
            timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            breaker: BreakerConfig::default(),
            max_concurrent: None,
        }
    }

    /// Merge explicit overrides into this config.
    pub fn apply(&mut self, patch: &OperationPatch) {
        if let Some(retries) = patch.retries {
            self.retries = retries;
        }
        if let Some(timeout) = patch.timeout {
            self.timeout = timeout;
        }
        if let Some(initial_delay) = patch.initial_delay {
            self.backoff.initial_delay = initial_delay;
        }
        if let Some(factor) = patch.backoff_factor {
            self.backoff.factor = factor;
        }
        if let Some(max_concurrent) = patch.max_concurrent {
            self.max_concurrent = Some(max_concurrent);
        }
    }
}

/// Explicit overrides merged into an [`OperationConfig`].
#[derive(Debug, Clone, Default)]
pub struct OperationPatch {
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub initial_delay: Option<Duration>,
    pub backoff_factor: Option<f64>,
    pub max_concurrent: Option<usize>,
}

impl OperationPatch {
    /// A predefined bundle by name: `"standard"`, `"aggressive"`, or
    /// `"interactive"`.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "standard" => Some(Self {
                retries: Some(3),
                timeout: Some(Duration::from_secs(60)),
                initial_delay: Some(Duration::from_secs(1)),
                backoff_factor: Some(2.0),
                ..Self::default()
            }),
            "aggressive" => Some(Self {
                retries: Some(5),
                timeout: Some(Duration::from_secs(120)),
                initial_delay: Some(Duration::from_millis(500)),
                backoff_factor: Some(2.0),
                ..Self::default()
            }),
            "interactive" => Some(Self {
                retries: Some(2),
                timeout: Some(Duration::from_secs(10)),
                initial_delay: Some(Duration::from_millis(500)),
                backoff_factor: Some(1.5),
                ..Self::default()
            }),
            _ => None,
        }
    }
}

/// One logical operation wrapped in the full resilience stack.
pub struct ResilientOperation {
    config: OperationConfig,
    limiter: Arc<RateLimitManager>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Arc<Bulkhead>,
    cancel: CancellationToken,
    token_estimate: u64,
    cache: Option<Arc<dyn CacheStore>>,
    on_rate_limit_update: Option<RateLimitObserver>,
}

impl ResilientOperation {
    /// Bind an operation to the shared primitives for its bucket id.
    pub fn new(config: OperationConfig, registry: &ResilienceRegistry) -> Self {
        let limiter = registry.limiter(&config.bucket_id, config.rate_limit);
        let breaker = registry.breaker(&config.bucket_id, config.breaker.clone());
        let bulkhead = registry.bulkhead();
        Self {
            config,
            limiter,
            breaker,
            bulkhead,
            cancel: CancellationToken::new(),
            token_estimate: 0,
            cache: None,
            on_rate_limit_update: None,
        }
    }

    /// Estimated LLM tokens this call withdraws from the token bucket.
    pub fn with_tokens(mut self, estimate: u64) -> Self {
        self.token_estimate = estimate;
        self
    }

    /// Enable cache lookup and 200-write for this operation.
    pub fn with_cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Inject an external cancellation token.
    pub fn with_abort(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Merge explicit config overrides.
    pub fn with_config(mut self, patch: OperationPatch) -> Self {
        self.config.apply(&patch);
        self
    }

    /// Merge a named preset bundle; unknown names leave the config
    /// untouched.
    pub fn preset(mut self, name: &str) -> Self {
        if let Some(patch) = OperationPatch::preset(name) {
            self.config.apply(&patch);
        }
        self
    }

    /// Observe server-reported rate-limit updates.
    pub fn on_rate_limit_update(mut self, observer: RateLimitObserver) -> Self {
        self.on_rate_limit_update = Some(observer);
        self
    }

    pub fn bucket_id(&self) -> &str {
        &self.config.bucket_id
    }

    /// Run the operation: bulkhead, cache, deadline, and the retry loop.
    pub async fn execute(
        &self,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
    ) -> Result<HttpResponse> {
        let _slot = self
            .bulkhead
            .acquire(&self.config.bucket_id, self.config.max_concurrent)?;

        // A cache hit bypasses buckets and breaker entirely.
        let key = match &self.cache {
            Some(store) => {
                let key = cache_key(&request.url, &request.body, &request.headers);
                if let Some(hit) = store.get(&key).await {
                    debug!(bucket = %self.config.bucket_id, "request cache hit");
                    return Ok(HttpResponse {
                        data: hit.data,
                        status: hit.status,
                        retry_after: None,
                        rate_limit: None,
                    });
                }
                Some(key)
            }
            None => None,
        };

        // The child token fires on caller abort (propagated from the
        // parent) or on the deadline below, aborting in-flight I/O.
        let attempt_cancel = self.cancel.child_token();
        tokio::select! {
            result = self.attempt_loop(transport, request, &attempt_cancel, key.as_deref()) => result,
            _ = tokio::time::sleep(self.config.timeout) => {
                attempt_cancel.cancel();
                self.breaker.record_failure();
                warn!(bucket = %self.config.bucket_id, timeout_ms = self.config.timeout.as_millis() as u64, "operation deadline exceeded");
                Err(LlmError::Timeout)
            }
        }
    }

    async fn attempt_loop(
        &self,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
        cancel: &CancellationToken,
        key: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut delay = self.config.backoff.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            if self.breaker.is_open() {
                return Err(LlmError::CircuitOpen(self.config.bucket_id.clone()));
            }
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            self.limiter.acquire(self.token_estimate, cancel).await?;

            match self.attempt_once(transport, request, cancel).await {
                Ok(response) => {
                    self.breaker.record_success();
                    if let (Some(key), Some(store)) = (key, &self.cache) {
                        if response.status == 200 {
                            store
                                .put(
                                    key,
                                    CachedResponse {
                                        data: response.data.clone(),
                                        status: response.status,
                                    },
                                )
                                .await;
                        }
                    }
                    return Ok(response);
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                // Already counted when the breaker opened; do not vote twice.
                Err(e @ LlmError::CircuitOpen(_)) => return Err(e),
                Err(e) => {
                    if e.counts_as_breaker_failure() {
                        self.breaker.record_failure();
                    }
                    if !e.should_retry() || attempt >= self.config.retries {
                        return Err(e);
                    }
                    let wait = match e.retry_after() {
                        Some(server_wait) => server_wait,
                        None => self.config.backoff.jittered(delay),
                    };
                    debug!(
                        bucket = %self.config.bucket_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    delay = self.config.backoff.next_delay(delay);
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        transport: &dyn HttpTransport,
        request: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let response = transport.call(request, cancel).await?;

        // Server-reported limits apply regardless of status: 429s are
        // precisely when providers announce their budgets.
        if let Some(info) = &response.rate_limit {
            self.limiter.update(info);
            if let Some(observer) = &self.on_rate_limit_update {
                observer(info);
            }
        }

        if (200..300).contains(&response.status) {
            Ok(response)
        } else {
            Err(LlmError::Http {
                status: response.status,
                body: provider_message(&response.data),
                retry_after: response.retry_after,
            })
        }
    }
}

impl std::fmt::Debug for ResilientOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientOperation")
            .field("bucket_id", &self.config.bucket_id)
            .field("retries", &self.config.retries)
            .field("timeout", &self.config.timeout)
            .field("token_estimate", &self.token_estimate)
            .field("has_cache", &self.cache.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{MockResponse, MockTransport};
    use crate::resilience::cache::MemoryCacheStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    fn request() -> HttpRequest {
        HttpRequest::new(
            "https://api.openai.com/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hello"}]}),
        )
    }

    fn fast_config(bucket_id: &str) -> OperationConfig {
        let mut config = OperationConfig::new(bucket_id);
        config.backoff.initial_delay = Duration::from_millis(10);
        config
    }

    #[test]
    fn test_backoff_next_delay_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        let d1 = policy.next_delay(Duration::from_secs(1));
        let d2 = policy.next_delay(d1);
        assert_eq!(d1, Duration::from_secs(2));
        assert_eq!(d2, Duration::from_secs(4));

        let capped = policy.next_delay(Duration::from_secs(50));
        assert_eq!(capped, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_factor_floor_is_one() {
        let policy = BackoffPolicy {
            factor: 0.5,
            ..BackoffPolicy::default()
        };
        assert_eq!(
            policy.next_delay(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_full_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..BackoffPolicy::default()
        };
        for _ in 0..100 {
            assert!(policy.jittered(Duration::from_secs(2)) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_preset_bundles() {
        let aggressive = OperationPatch::preset("aggressive").unwrap();
        assert_eq!(aggressive.retries, Some(5));
        let interactive = OperationPatch::preset("interactive").unwrap();
        assert_eq!(interactive.timeout, Some(Duration::from_secs(10)));
        assert!(OperationPatch::preset("nope").is_none());
    }

    #[test]
    fn test_config_apply_patch() {
        let mut config = OperationConfig::new("openai");
        config.apply(&OperationPatch {
            retries: Some(0),
            max_concurrent: Some(2),
            backoff_factor: Some(3.0),
            ..OperationPatch::default()
        });
        assert_eq!(config.retries, 0);
        assert_eq!(config.max_concurrent, Some(2));
        assert_eq!(config.backoff.factor, 3.0);
        // Untouched fields keep their defaults.
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_happy_path_single_invocation() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::ok(json!({"text": "hi"})));
        let op = ResilientOperation::new(fast_config("openai"), &registry).with_tokens(10);

        let response = op.execute(&transport, &request()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data["text"], "hi");
        assert_eq!(transport.calls(), 1);
        assert_eq!(registry.breaker_status("openai").unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_transient_500_retried_to_success() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::new(vec![
            MockResponse::new(500, json!({"error": {"message": "boom"}})),
            MockResponse::new(500, json!({"error": {"message": "boom"}})),
            MockResponse::ok(json!({"text": "ok"})),
        ]);
        let op = ResilientOperation::new(fast_config("openai"), &registry).with_config(
            OperationPatch {
                retries: Some(3),
                backoff_factor: Some(2.0),
                ..OperationPatch::default()
            },
        );

        let started = Instant::now();
        let response = op.execute(&transport, &request()).await.unwrap();
        assert_eq!(response.data["text"], "ok");
        assert_eq!(transport.calls(), 3);
        // Two backoffs: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        // Success fully reset the breaker after its two failure votes.
        let status = registry.breaker_status("openai").unwrap();
        assert_eq!(status.fail_count, 0);
        assert!(!status.is_open);
    }

    #[tokio::test]
    async fn test_backoff_waits_grow_exponentially() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::new(vec![
            MockResponse::new(503, json!({})),
            MockResponse::new(503, json!({})),
            MockResponse::ok(json!({})),
        ]);
        let mut config = OperationConfig::new("openai");
        config.backoff.initial_delay = Duration::from_millis(100);
        let op = ResilientOperation::new(config, &registry);

        let started = Instant::now();
        op.execute(&transport, &request()).await.unwrap();
        let elapsed = started.elapsed();
        // 100ms + 200ms of backoff.
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_zero_retries_surfaces_first_failure() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::new(500, json!({})));
        let op = ResilientOperation::new(fast_config("openai"), &registry).with_config(
            OperationPatch {
                retries: Some(0),
                ..OperationPatch::default()
            },
        );

        let err = op.execute(&transport, &request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 500, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_invocations_bounded_by_retry_budget() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::new(503, json!({})));
        let mut config = fast_config("openai");
        config.retries = 2;
        // Keep the breaker out of the way for this property.
        config.breaker.failure_threshold = 100;
        let op = ResilientOperation::new(config, &registry);

        let err = op.execute(&transport, &request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 503, .. }));
        assert_eq!(transport.calls(), 3); // retries + 1
    }

    #[tokio::test]
    async fn test_hard_4xx_not_retried_but_votes() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::new(
            400,
            json!({"error": {"message": "bad request"}}),
        ));
        let op = ResilientOperation::new(fast_config("openai"), &registry);

        let err = op.execute(&transport, &request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 400, .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(registry.breaker_status("openai").unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_then_fast_fails() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::new(500, json!({})));
        let mut config = fast_config("openai");
        config.retries = 5;
        config.breaker.failure_threshold = 2;

        let op = ResilientOperation::new(config.clone(), &registry);
        let err = op.execute(&transport, &request()).await.unwrap_err();
        // Two attempts voted the breaker open; the loop then fast-failed.
        assert!(matches!(err, LlmError::CircuitOpen(_)));
        assert_eq!(transport.calls(), 2);
        assert!(registry.breaker_status("openai").unwrap().is_open);

        // A fresh operation on the same bucket fails without invoking the
        // transport at all.
        let op2 = ResilientOperation::new(config, &registry);
        let started = Instant::now();
        let err = op2.execute(&transport, &request()).await.unwrap_err();
        assert!(matches!(err, LlmError::CircuitOpen(_)));
        assert_eq!(transport.calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::new(vec![
            MockResponse::new(429, json!({"error": {"message": "slow down"}}))
                .with_retry_after(Duration::from_secs(2)),
            MockResponse::ok(json!({"text": "ok"})),
        ]);
        let op = ResilientOperation::new(fast_config("openai"), &registry);

        let started = Instant::now();
        let response = op.execute(&transport, &request()).await.unwrap();
        assert_eq!(response.data["text"], "ok");
        assert_eq!(transport.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_past_retry_after_retries_immediately() {
        let registry = ResilienceRegistry::new();
        // A Retry-After HTTP-date in the past parses to zero.
        let transport = MockTransport::new(vec![
            MockResponse::new(429, json!({})).with_retry_after(Duration::ZERO),
            MockResponse::ok(json!({})),
        ]);
        let op = ResilientOperation::new(fast_config("openai"), &registry);

        let started = Instant::now();
        op.execute(&transport, &request()).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout() {
        let registry = ResilienceRegistry::new();
        let transport = MockTransport::fixed(MockResponse::ok(json!({})))
            .with_latency(Duration::from_millis(300));
        let mut config = fast_config("openai");
        config.timeout = Duration::from_millis(50);
        let op = ResilientOperation::new(config, &registry);

        let err = op.execute(&transport, &request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout));
        // The aborted attempt counts as one failure vote.
        assert_eq!(registry.breaker_status("openai").unwrap().fail_count, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_transport_and_buckets() {
        let registry = ResilienceRegistry::new();
        let store = Arc::new(MemoryCacheStore::new());
        let transport = MockTransport::fixed(MockResponse::ok(json!({"text": "cached"})));

        let op = ResilientOperation::new(fast_config("openai"), &registry)
            .with_tokens(10)
            .with_cache(store.clone());
        op.execute(&transport, &request()).await.unwrap();
        assert_eq!(transport.calls(), 1);
        assert_eq!(store.len(), 1);

        let limiter = registry.limiter("openai", RateLimitConfig::default());
        let before = limiter.snapshot();

        let op2 = ResilientOperation::new(fast_config("openai"), &registry)
            .with_tokens(10)
            .with_cache(store.clone());
        let response = op2.execute(&transport, &request()).await.unwrap();
        assert_eq!(response.data["text"], "cached");
        assert_eq!(transport.calls(), 1);
        assert_eq!(limiter.snapshot(), before);
    }

    #[tokio::test]
    async fn test_non_200_not_cached() {
        let registry = ResilienceRegistry::new();
        let store = Arc::new(MemoryCacheStore::new());
        let transport = MockTransport::fixed(MockResponse::new(500, json!({})));
        let op = ResilientOperation::new(fast_config("openai"), &registry)
            .with_cache(store.clone())
            .with_config(OperationPatch {
                retries: Some(0),
                ..OperationPatch::default()
            });

        let _ = op.execute(&transport, &request()).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_bulkhead_limits_concurrency() {
        let registry = Arc::new(ResilienceRegistry::new());
        let transport = Arc::new(
            MockTransport::fixed(MockResponse::ok(json!({})))
                .with_latency(Duration::from_millis(100)),
        );

        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = registry.clone();
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let mut config = fast_config("openai");
                config.max_concurrent = Some(2);
                let op = ResilientOperation::new(config, &registry);
                op.execute(transport.as_ref(), &request()).await
            }));
        }

        let mut successes = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(LlmError::ConcurrencyExceeded(_)) => rejections += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(successes, 2);
        assert_eq!(rejections, 1);
        // All slots released.
        assert_eq!(registry.bulkhead().in_flight("openai"), 0);
    }

    #[tokio::test]
    async fn test_cancellation_during_rate_limit_wait() {
        let registry = ResilienceRegistry::new();
        let transport = Arc::new(MockTransport::fixed(MockResponse::ok(json!({}))));
        let cancel = CancellationToken::new();

        let mut config = fast_config("openai");
        // Empty buckets: the acquire loop can never succeed.
        config.rate_limit = RateLimitConfig {
            requests_per_minute: 0,
            llm_tokens_per_minute: 0,
        };
        let op = ResilientOperation::new(config, &registry).with_abort(cancel.clone());

        let task = {
            let transport = transport.clone();
            tokio::spawn(async move { op.execute(transport.as_ref(), &request()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(transport.calls(), 0);
        assert_eq!(registry.breaker_status("openai").unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_abort_mid_latency_cancels_transport() {
        let registry = ResilienceRegistry::new();
        let transport = Arc::new(
            MockTransport::fixed(MockResponse::ok(json!({}))).with_latency(Duration::from_secs(5)),
        );
        let cancel = CancellationToken::new();
        let op =
            ResilientOperation::new(fast_config("openai"), &registry).with_abort(cancel.clone());

        let task = {
            let transport = transport.clone();
            tokio::spawn(async move { op.execute(transport.as_ref(), &request()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500));
        // Cancellation is not a failure vote.
        assert_eq!(registry.breaker_status("openai").unwrap().fail_count, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_update_applied_and_observed() {
        let registry = ResilienceRegistry::new();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport::fixed(MockResponse::ok(json!({})).with_rate_limit(
            RateLimitInfo {
                requests_per_minute: Some(10),
                llm_tokens_per_minute: Some(500),
            },
        ));

        let observer: RateLimitObserver = {
            let observed = observed.clone();
            Arc::new(move |info: &RateLimitInfo| {
                observed.lock().unwrap().push(*info);
            })
        };
        let op = ResilientOperation::new(fast_config("openai"), &registry)
            .on_rate_limit_update(observer);
        op.execute(&transport, &request()).await.unwrap();

        let seen = observed.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].requests_per_minute, Some(10));

        // The manager was re-parameterized to the reported budgets.
        let limiter = registry.limiter("openai", RateLimitConfig::default());
        let (requests, llm_tokens) = limiter.snapshot();
        assert_eq!(requests, 10.0);
        assert_eq!(llm_tokens, 500.0);
    }
}
