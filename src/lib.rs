//! # LLM Resilience
//!
//! A resilient chat client for LLM HTTP APIs. One uniform [`chat`]
//! operation dispatches a conversation to any configured provider
//! (OpenAI-compatible, Anthropic messages, Ollama generate, Google's
//! OpenAI-compatible Gemini endpoint) behind a full resilience stack:
//!
//! - **Rate limiting** — dual token buckets per provider (requests and
//!   estimated LLM tokens), re-parameterized on the fly from
//!   server-reported limits.
//! - **Circuit breaking** — per-provider failure counting with cooldown.
//! - **Bulkhead** — bounded in-flight operations per provider.
//! - **Retry** — bounded, exponential backoff, honoring `Retry-After`.
//! - **Timeout & cancellation** — a whole-operation deadline and an
//!   instance-wide abort that reach every sleep and in-flight request.
//! - **Caching** — optional response cache keyed by the fully-formed
//!   HTTP request.
//! - **Fallback** — cross-provider failover when a provider stays
//!   unavailable (429/529).
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_resilience::{ChatMessage, ChatOptions, LlmClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = LlmClient::builder()
//!         .service("openai")
//!         .retries(3)
//!         .build();
//!
//!     let reply = client
//!         .chat(
//!             &[
//!                 ChatMessage::system("Answer briefly."),
//!                 ChatMessage::user("Why is the sky blue?"),
//!             ],
//!             Some(ChatOptions::new().with_temperature(0.2)),
//!         )
//!         .await?;
//!     println!("{}", reply.text());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! LlmClient ──► codec (body, auth, parse path) ──► ResilientOperation
//!                                                       │
//!                    bulkhead ── cache ── deadline ── breaker
//!                        ── rate limits ── retry/backoff ── HttpTransport
//! ```
//!
//! Providers are configuration, not code: see
//! [`ProviderRegistry`](provider::ProviderRegistry). The resilience
//! primitives are shared per bucket id through a
//! [`ResilienceRegistry`](resilience::ResilienceRegistry) wired through
//! construction, never a hidden global.

pub mod client;
pub mod error;
pub mod estimator;
pub mod http;
pub mod provider;
pub mod resilience;
pub mod types;

pub use client::{ClientConfig, LlmClient, LlmClientBuilder};
pub use error::{ErrorKind, LlmError, Result};
pub use estimator::{HeuristicEstimator, TokenEstimator};
pub use http::{HttpRequest, HttpResponse, HttpTransport, MockTransport, ReqwestTransport};
pub use provider::{ModelInfo, ProviderRegistry};
pub use resilience::{
    BackoffPolicy, BreakerConfig, BreakerStatus, CacheStore, MemoryCacheStore, OperationConfig,
    RateLimitInfo, ResilienceRegistry, ResilientOperation,
};
pub use types::{ChatMessage, ChatOptions, ChatOutcome, RateLimitConfig, Role, Tool, ToolCall};
