//! Request body shaping and response extraction per provider kind.
//!
//! The codec is data-driven: [`ProviderKind`] picks the body layout,
//! [`ToolSchemaType`] picks the tool schema field, and the registry's
//! parse path locates the assistant text. No runtime string switches.

use serde_json::{json, Value};

use super::{ProviderKind, ToolSchemaType};
use crate::types::{ChatMessage, Role, Tool, ToolCall};

/// Everything the codec needs besides the conversation itself.
#[derive(Debug, Clone)]
pub struct ChatRequestParams<'a> {
    pub model: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    /// Effort hint sent to reasoning models.
    pub reasoning_effort: &'a str,
    pub tools: Option<&'a [Tool]>,
}

/// Whether a model takes `max_completion_tokens` + `reasoning_effort`
/// instead of `max_tokens`/`temperature`/`top_p`.
///
/// Matches the `o1`/`o3`/`o4-mini` family and `gpt-5` ids. Only the
/// OpenAI-compatible body shape branches on this; the other wire
/// formats have no equivalent fields.
pub fn is_reasoning_model(model: &str) -> bool {
    if model.starts_with("gpt-5") {
        return true;
    }
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

/// Pull the system prompt out of a conversation, Anthropic style.
///
/// The **last** system message wins; all system entries are removed from
/// the returned conversation. Idempotent: re-extracting from the
/// reconstructed conversation yields the same system prompt.
pub fn extract_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone());
    let rest = messages.iter().filter(|m| m.role != Role::System).collect();
    (system, rest)
}

fn message_values(messages: &[&ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

/// Flatten a conversation into a single generate-style prompt.
fn flatten_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn tool_value(tool: &Tool, schema: ToolSchemaType) -> Value {
    match schema {
        ToolSchemaType::OpenAi => json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            },
        }),
        ToolSchemaType::Anthropic => json!({
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        }),
    }
}

/// Build the provider request body for one chat call.
pub fn build_chat_body(
    kind: ProviderKind,
    tool_schema: ToolSchemaType,
    messages: &[ChatMessage],
    params: &ChatRequestParams<'_>,
) -> Value {
    match kind {
        ProviderKind::OpenAiCompatible => {
            let all: Vec<&ChatMessage> = messages.iter().collect();
            let mut body = json!({
                "model": params.model,
                "messages": message_values(&all),
            });
            if is_reasoning_model(params.model) {
                body["max_completion_tokens"] = json!(params.max_tokens);
                body["reasoning_effort"] = json!(params.reasoning_effort);
            } else {
                body["max_tokens"] = json!(params.max_tokens);
                body["temperature"] = json!(params.temperature);
                body["top_p"] = json!(params.top_p);
            }
            if let Some(tools) = params.tools {
                body["tools"] = Value::Array(
                    tools.iter().map(|t| tool_value(t, tool_schema)).collect(),
                );
            }
            body
        }
        ProviderKind::Anthropic => {
            let (system, rest) = extract_system(messages);
            // Reasoning-model parameters are OpenAI wire format; an
            // Anthropic body always carries max_tokens/temperature/top_p.
            let mut body = json!({
                "model": params.model,
                "messages": message_values(&rest),
                "max_tokens": params.max_tokens,
                "temperature": params.temperature,
                "top_p": params.top_p,
            });
            if let Some(system) = system {
                body["system"] = json!(system);
            }
            if let Some(tools) = params.tools {
                body["tools"] = Value::Array(
                    tools.iter().map(|t| tool_value(t, tool_schema)).collect(),
                );
            }
            body
        }
        ProviderKind::Ollama => json!({
            "model": params.model,
            "prompt": flatten_prompt(messages),
            "stream": false,
            "options": {
                "temperature": params.temperature,
                "num_predict": params.max_tokens,
                "top_p": params.top_p,
            },
        }),
    }
}

/// Extract tool invocations from a successful response body.
pub fn extract_tool_calls(kind: ProviderKind, data: &Value) -> Vec<ToolCall> {
    match kind {
        ProviderKind::OpenAiCompatible => data
            .pointer("/choices/0/message/tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let name = function.get("name")?.as_str()?.to_string();
                        let arguments = match function.get("arguments") {
                            Some(Value::String(raw)) => serde_json::from_str(raw)
                                .unwrap_or_else(|_| Value::String(raw.clone())),
                            Some(other) => other.clone(),
                            None => Value::Null,
                        };
                        Some(ToolCall {
                            id: call.get("id").and_then(Value::as_str).map(String::from),
                            name,
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        ProviderKind::Anthropic => data
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
                    .filter_map(|block| {
                        Some(ToolCall {
                            id: block.get("id").and_then(Value::as_str).map(String::from),
                            name: block.get("name")?.as_str()?.to_string(),
                            arguments: block.get("input").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        ProviderKind::Ollama => Vec::new(),
    }
}
