//! The chat facade.
//!
//! [`LlmClient`] turns a conversation into one provider HTTP call
//! executed through the resilience engine, and falls over to the next
//! configured provider when the current one is persistently unavailable
//! (429/529 after the engine's own retries).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, LlmError, Result};
use crate::estimator::{HeuristicEstimator, TokenEstimator};
use crate::http::{HttpRequest, HttpTransport, ReqwestTransport};
use crate::provider::codec::{self, ChatRequestParams};
use crate::provider::{parse_path, ProviderRegistry};
use crate::resilience::{
    BreakerConfig, BreakerStatus, CacheStore, OperationConfig, RateLimitObserver,
    ResilienceRegistry, ResilientOperation,
};
use crate::types::{ChatMessage, ChatOptions, ChatOutcome, RateLimitConfig};

/// Instance-wide defaults for [`LlmClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default provider id.
    pub service: String,
    /// Default model; `None` uses the provider's `default_model`.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Estimated-input ceiling; larger conversations are rejected.
    pub max_input_tokens: u32,
    pub top_p: f64,
    /// Effort hint sent to reasoning models.
    pub reasoning_effort: String,
    /// Whole-operation deadline per call.
    pub timeout: Duration,
    /// Retry budget per call.
    pub retries: u32,
    /// Backoff multiplier between retries.
    pub backoff_factor: f64,
    /// Per-provider bucket budgets (apply on each bucket's first use).
    pub rate_limit: RateLimitConfig,
    /// Per-provider breaker parameters (apply on first use).
    pub breaker: BreakerConfig,
    /// Per-provider in-flight ceiling; `None` disables the bulkhead.
    pub max_concurrent: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service: "openai".into(),
            model: None,
            temperature: 0.7,
            max_tokens: 2048,
            max_input_tokens: 8192,
            top_p: 1.0,
            reasoning_effort: "medium".into(),
            timeout: Duration::from_secs(60),
            retries: 3,
            backoff_factor: 2.0,
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            max_concurrent: None,
        }
    }
}

/// Resilient chat client over heterogeneous LLM providers.
///
/// # Example
///
/// ```no_run
/// use llm_resilience::{ChatMessage, LlmClient};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = LlmClient::builder()
///         .service("openai")
///         .retries(3)
///         .build();
///
///     let reply = client
///         .chat(&[ChatMessage::user("Why is the sky blue?")], None)
///         .await?;
///     println!("{}", reply.text());
///     Ok(())
/// }
/// ```
pub struct LlmClient {
    config: ClientConfig,
    providers: Arc<ProviderRegistry>,
    resilience: Arc<ResilienceRegistry>,
    transport: Arc<dyn HttpTransport>,
    estimator: Arc<dyn TokenEstimator>,
    cache: Option<Arc<dyn CacheStore>>,
    on_rate_limit_update: Option<RateLimitObserver>,
    /// Instance-wide abort handle; replaced after each `abort()`.
    cancel: Mutex<CancellationToken>,
}

impl LlmClient {
    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::default()
    }

    /// The provider directory backing this client.
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Breaker snapshot for a provider, if one has been created.
    pub fn breaker_status(&self, provider: &str) -> Option<BreakerStatus> {
        self.resilience.breaker_status(provider)
    }

    /// Cancel every in-flight operation on this instance.
    ///
    /// Subsequent calls run under a fresh handle.
    pub fn abort(&self) {
        let mut cancel = self.cancel.lock().unwrap();
        cancel.cancel();
        *cancel = CancellationToken::new();
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Run one chat call, falling back across providers on persistent
    /// unavailability.
    pub async fn chat(
        &self,
        history: &[ChatMessage],
        options: Option<ChatOptions>,
    ) -> Result<ChatOutcome> {
        let options = options.unwrap_or_default();
        let mut service = options
            .service
            .clone()
            .unwrap_or_else(|| self.config.service.clone());
        let mut model_override = options.model.clone().or_else(|| self.config.model.clone());
        let mut out_of_service: HashSet<String> = HashSet::new();

        loop {
            match self
                .chat_once(history, &options, &service, model_override.as_deref())
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if matches!(err.kind(), ErrorKind::RateLimited | ErrorKind::Overloaded) =>
                {
                    warn!(provider = %service, error = %err, "provider out of service, trying fallback");
                    out_of_service.insert(service.clone());
                    match self.next_provider(&out_of_service) {
                        Some(next) => {
                            // The fallback provider runs with its own
                            // default model.
                            model_override = None;
                            service = next;
                        }
                        None => return Err(LlmError::NoAlternativeProvider),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// First active provider, in registry order, not yet out of service.
    fn next_provider(&self, out_of_service: &HashSet<String>) -> Option<String> {
        self.providers
            .list()
            .into_iter()
            .filter(|p| p.active && !out_of_service.contains(&p.id))
            .map(|p| p.id)
            .next()
    }

    async fn chat_once(
        &self,
        history: &[ChatMessage],
        options: &ChatOptions,
        service: &str,
        model_override: Option<&str>,
    ) -> Result<ChatOutcome> {
        let provider = self
            .providers
            .get(service)
            .filter(|p| p.active)
            .ok_or_else(|| LlmError::InvalidProvider(service.to_string()))?;
        let model = model_override.unwrap_or(&provider.default_model);

        // Estimate before spending anything.
        let combined: String = history
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let estimated = self.estimator.estimate(&combined);
        if estimated > self.config.max_input_tokens {
            return Err(LlmError::InputTooLarge {
                estimated,
                max: self.config.max_input_tokens,
            });
        }

        let params = ChatRequestParams {
            model,
            temperature: options.temperature.unwrap_or(self.config.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
            top_p: options.top_p.unwrap_or(self.config.top_p),
            reasoning_effort: options
                .reasoning_effort
                .as_deref()
                .unwrap_or(&self.config.reasoning_effort),
            tools: options.tools.as_deref(),
        };
        let kind = provider.kind();
        let body = codec::build_chat_body(kind, provider.chat.tool_schema_type, history, &params);

        let key = self
            .providers
            .resolve_api_key(service, options.api_key.as_deref())?;
        let headers =
            self.providers
                .build_auth_headers(service, key.as_deref(), HashMap::new())?;
        let url = provider.chat_url()?;
        let url = self.providers.build_api_url(service, &url, key.as_deref());

        debug!(provider = %service, model, estimated_tokens = estimated, "dispatching chat call");

        let mut op_config = OperationConfig::new(service);
        op_config.rate_limit = self.config.rate_limit;
        op_config.retries = self.config.retries;
        op_config.timeout = self.config.timeout;
        op_config.backoff.factor = self.config.backoff_factor;
        op_config.breaker = self.config.breaker.clone();
        op_config.max_concurrent = self.config.max_concurrent;

        let mut operation = ResilientOperation::new(op_config, &self.resilience)
            .with_tokens(estimated as u64)
            .with_abort(self.current_cancel());
        if let Some(store) = &self.cache {
            operation = operation.with_cache(store.clone());
        }
        if let Some(observer) = &self.on_rate_limit_update {
            operation = operation.on_rate_limit_update(observer.clone());
        }

        let request = HttpRequest::new(url, body).with_headers(headers);
        let response = operation.execute(self.transport.as_ref(), &request).await?;

        // Tool calls take precedence over plain text when tools were sent.
        if options.tools.is_some() {
            let tool_calls = codec::extract_tool_calls(kind, &response.data);
            if !tool_calls.is_empty() {
                let content = parse_path::walk_str(&response.data, &provider.chat.response_parse_path)
                    .unwrap_or_default()
                    .to_string();
                return Ok(ChatOutcome::ToolUse {
                    content,
                    tool_calls,
                });
            }
        }

        let path = &provider.chat.response_parse_path;
        let text = parse_path::walk_str(&response.data, path).ok_or_else(|| {
            LlmError::ResponseParse {
                path: path.clone(),
                message: "no string at path in response body".into(),
            }
        })?;
        Ok(ChatOutcome::Text(text.to_string()))
    }
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("service", &self.config.service)
            .field("retries", &self.config.retries)
            .field("timeout", &self.config.timeout)
            .field("has_cache", &self.cache.is_some())
            .finish()
    }
}

/// Builder for [`LlmClient`].
#[derive(Default)]
pub struct LlmClientBuilder {
    config: ClientConfig,
    providers: Option<Arc<ProviderRegistry>>,
    resilience: Option<Arc<ResilienceRegistry>>,
    transport: Option<Arc<dyn HttpTransport>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    cache: Option<Arc<dyn CacheStore>>,
    on_rate_limit_update: Option<RateLimitObserver>,
}

impl LlmClientBuilder {
    /// Default provider id. Default: `"openai"`.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.config.service = service.into();
        self
    }

    /// Default model; unset uses each provider's `default_model`.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f64) -> Self {
        self.config.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    pub fn max_input_tokens(mut self, max_input_tokens: u32) -> Self {
        self.config.max_input_tokens = max_input_tokens;
        self
    }

    pub fn top_p(mut self, top_p: f64) -> Self {
        self.config.top_p = top_p;
        self
    }

    /// Whole-operation deadline per call. Default: 60 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Retry budget per call. Default: 3.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Backoff multiplier. Default: 2.0.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn breaker(mut self, breaker: BreakerConfig) -> Self {
        self.config.breaker = breaker;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = Some(max_concurrent);
        self
    }

    /// Share a provider registry across clients.
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Share resilience state (buckets, breakers, bulkhead) across
    /// clients.
    pub fn resilience(mut self, resilience: Arc<ResilienceRegistry>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Inject a transport. Default: [`ReqwestTransport`].
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Inject a token estimator. Default: [`HeuristicEstimator`].
    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Enable request caching through the given store.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Observe server-reported rate-limit updates.
    pub fn on_rate_limit_update(mut self, observer: RateLimitObserver) -> Self {
        self.on_rate_limit_update = Some(observer);
        self
    }

    pub fn build(self) -> LlmClient {
        LlmClient {
            config: self.config,
            providers: self
                .providers
                .unwrap_or_else(|| Arc::new(ProviderRegistry::new())),
            resilience: self
                .resilience
                .unwrap_or_else(|| Arc::new(ResilienceRegistry::new())),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(ReqwestTransport::new())),
            estimator: self
                .estimator
                .unwrap_or_else(|| Arc::new(HeuristicEstimator::new())),
            cache: self.cache,
            on_rate_limit_update: self.on_rate_limit_update,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}
