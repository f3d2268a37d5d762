//! HTTP call surface consumed by the resilience engine.
//!
//! The engine never talks to a provider directly; it drives an
//! [`HttpTransport`], which returns a structured [`HttpResponse`] for
//! *any* status code and errors only on transport-level faults. Status
//! classification is the engine's job, not the transport's.

pub mod mock;

pub use mock::{MockResponse, MockTransport};

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{LlmError, Result};
use crate::resilience::rate_limit::RateLimitInfo;

/// A fully-formed provider request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub body: Value,
    pub headers: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            body,
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// A provider response, returned for any status code.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Parsed JSON body; a JSON string when the body was not JSON.
    pub data: Value,
    pub status: u16,
    /// Parsed `Retry-After` header, when present.
    pub retry_after: Option<Duration>,
    /// Server-reported rate limits, when present.
    pub rate_limit: Option<RateLimitInfo>,
}

/// The HTTP call the engine wraps.
///
/// Implementations must propagate the cancellation token to the
/// underlying I/O so a fired token aborts in-flight requests promptly,
/// surfacing [`LlmError::Cancelled`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn call(&self, request: &HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse>;
}

/// Parse a `Retry-After` header value.
///
/// Accepts an integer number of seconds or an HTTP-date (clamped at
/// zero when in the past). An unparseable value defaults to one second.
pub fn parse_retry_after(value: &str) -> Duration {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    if let Ok(date) = httpdate::parse_http_date(value) {
        return date
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
    }
    Duration::from_secs(1)
}

/// Pull the provider's human-readable error message out of a response
/// body, falling back to the compact body itself.
pub fn provider_message(data: &Value) -> String {
    for path in [&["error", "message"][..], &["error"], &["message"]] {
        let mut current = data;
        let mut found = true;
        for key in path {
            match current.get(key) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(s) = current.as_str() {
                return s.to_string();
            }
        }
    }
    match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    let requests = header_u64("x-ratelimit-limit-requests");
    let tokens = header_u64("x-ratelimit-limit-tokens");
    if requests.is_none() && tokens.is_none() {
        return None;
    }
    Some(RateLimitInfo {
        requests_per_minute: requests.map(|v| v as u32),
        llm_tokens_per_minute: tokens,
    })
}

/// Default transport backed by a shared [`reqwest::Client`].
///
/// Carries no client-level timeout; the whole-operation deadline in the
/// engine governs, and cancellation aborts the in-flight request.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-configured client (proxies, TLS settings, etc.).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
        let mut map = HeaderMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| LlmError::InvalidConfig(format!("bad header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| LlmError::InvalidConfig(format!("bad header value: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn call(&self, request: &HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let headers = Self::header_map(&request.headers)?;
        let send = self
            .client
            .post(&request.url)
            .headers(headers)
            .json(&request.body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            r = send => r?,
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(parse_retry_after);
        let rate_limit = rate_limit_from_headers(response.headers());

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            t = response.text() => t?,
        };
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse {
            data,
            status,
            retry_after,
            rate_limit,
        })
    }
}
