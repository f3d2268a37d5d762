//! Shared chat types: messages, tools, outcomes, and per-call options.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

impl Role {
    /// Wire-format name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    /// Shorthand for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Shorthand for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A tool the model may call, described by a JSON schema.
///
/// `parameters` holds the JSON-schema object in OpenAI shape; the codec
/// converts it to the provider's expected field (`parameters` or
/// `input_schema`) when building the request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned call id, when present.
    pub id: Option<String>,
    /// Name of the tool to invoke.
    pub name: String,
    /// Parsed arguments object.
    pub arguments: Value,
}

/// Result of a chat call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    /// Plain assistant text.
    Text(String),
    /// The model requested one or more tool invocations.
    ToolUse {
        /// Any assistant text accompanying the calls (may be empty).
        content: String,
        /// The requested invocations, in response order.
        tool_calls: Vec<ToolCall>,
    },
}

impl ChatOutcome {
    /// The assistant text, regardless of variant.
    pub fn text(&self) -> &str {
        match self {
            ChatOutcome::Text(s) => s,
            ChatOutcome::ToolUse { content, .. } => content,
        }
    }

    /// The tool calls, empty for plain text outcomes.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            ChatOutcome::Text(_) => &[],
            ChatOutcome::ToolUse { tool_calls, .. } => tool_calls,
        }
    }
}

/// Per-minute budgets for the two rate-limit buckets of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per minute.
    pub requests_per_minute: u32,
    /// Estimated LLM tokens allowed per minute.
    pub llm_tokens_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            llm_tokens_per_minute: 90_000,
        }
    }
}

/// Per-call overrides for [`LlmClient::chat`](crate::client::LlmClient::chat).
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Provider id to use instead of the instance default.
    pub service: Option<String>,
    /// Model id to use instead of the provider default.
    pub model: Option<String>,
    /// Sampling temperature override.
    pub temperature: Option<f64>,
    /// Completion token budget override.
    pub max_tokens: Option<u32>,
    /// Nucleus sampling override.
    pub top_p: Option<f64>,
    /// Effort hint for reasoning models (`"low"`, `"medium"`, `"high"`).
    pub reasoning_effort: Option<String>,
    /// Tools the model may call.
    pub tools: Option<Vec<Tool>>,
    /// Per-call API key, overriding stored and environment keys.
    pub api_key: Option<String>,
}

impl ChatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}
