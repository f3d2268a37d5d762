//! Mock transport for testing without a live provider.
//!
//! [`MockTransport`] returns scripted responses in order (cycling when
//! exhausted) and records every request it sees, so tests can assert on
//! invocation counts, URLs, and headers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{HttpRequest, HttpResponse, HttpTransport};
use crate::error::{LlmError, Result};
use crate::resilience::rate_limit::RateLimitInfo;

/// One scripted response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub data: Value,
    pub retry_after: Option<Duration>,
    pub rate_limit: Option<RateLimitInfo>,
}

impl MockResponse {
    pub fn new(status: u16, data: Value) -> Self {
        Self {
            status,
            data,
            retry_after: None,
            rate_limit: None,
        }
    }

    pub fn ok(data: Value) -> Self {
        Self::new(200, data)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.rate_limit = Some(info);
        self
    }
}

/// A test transport that serves canned responses in order.
///
/// Cycles back to the beginning when all responses have been consumed.
#[derive(Debug)]
pub struct MockTransport {
    responses: Vec<MockResponse>,
    index: AtomicUsize,
    recorded: Mutex<Vec<HttpRequest>>,
    latency: Option<Duration>,
}

impl MockTransport {
    /// Script the given responses, served in order.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        assert!(
            !responses.is_empty(),
            "MockTransport requires at least one response"
        );
        Self {
            responses,
            index: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// A transport that always returns the same response.
    pub fn fixed(response: MockResponse) -> Self {
        Self::new(vec![response])
    }

    /// Simulate per-call latency. The sleep is cancel-aware.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }

    /// Requests seen so far, in order.
    pub fn recorded(&self) -> Vec<HttpRequest> {
        self.recorded.lock().unwrap().clone()
    }

    fn next_response(&self) -> MockResponse {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn call(&self, request: &HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        self.recorded.lock().unwrap().push(request.clone());

        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        let scripted = self.next_response();
        Ok(HttpResponse {
            data: scripted.data,
            status: scripted.status,
            retry_after: scripted.retry_after,
            rate_limit: scripted.rate_limit,
        })
    }
}
