//! Provider configuration model.
//!
//! Providers are data, not code: a [`ProviderConfig`] carries the URLs,
//! auth scheme, message format, and response paths the facade needs, and
//! the [`ProviderKind`] tag derived from it picks the codec. Adding a
//! provider is configuration.

pub mod codec;
pub mod parse_path;
pub mod registry;

pub use registry::{ModelInfo, ProviderRegistry};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

/// Wire shape of the conversation in the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// `messages` array with system entries inline.
    OpenAi,
    /// Separate `system` field; system entries stripped from `messages`.
    Anthropic,
}

/// Field name the provider expects for tool JSON schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSchemaType {
    /// `function.parameters` (OpenAI shape).
    OpenAi,
    /// `input_schema` (Anthropic shape).
    Anthropic,
}

/// Codec dispatch tag, derived from [`ChatConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAiCompatible,
    Anthropic,
    Ollama,
}

/// How the API key travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthScheme {
    /// Key in a request header; `format` substitutes `{key}`.
    Header { name: String, format: String },
    /// Key as a URL query parameter.
    Query { param: String },
}

/// Authentication configuration for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(flatten)]
    pub scheme: AuthScheme,
    /// When true, a missing key is tolerated (local providers).
    #[serde(default)]
    pub optional: bool,
}

impl AuthConfig {
    /// Standard `Authorization: Bearer {key}` header auth.
    pub fn bearer() -> Self {
        Self {
            scheme: AuthScheme::Header {
                name: "Authorization".into(),
                format: "Bearer {key}".into(),
            },
            optional: false,
        }
    }
}

/// Chat behavior of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub message_format: MessageFormat,
    /// Dot/bracket path to the assistant text in the response body.
    pub response_parse_path: String,
    pub tool_schema_type: ToolSchemaType,
}

/// How to project the provider's model-list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseConfig {
    /// Path to the array of model records.
    pub models_path: String,
    pub id_field: String,
    pub name_field: String,
    #[serde(default)]
    pub display_name_field: Option<String>,
    #[serde(default)]
    pub context_window_field: Option<String>,
    /// When set, only model ids with this prefix are listed.
    #[serde(default)]
    pub id_prefix: Option<String>,
}

/// Full configuration of one provider.
///
/// `api_key` is write-only: it never serializes, so configurations read
/// back through the registry cannot leak stored keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub active: bool,
    /// Explicit chat endpoint; wins over `base_url`.
    #[serde(default)]
    pub chat_api_url: Option<String>,
    /// Base URL, auto-suffixed with the kind's chat path.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models_api_url: Option<String>,
    pub default_model: String,
    /// Environment variables consulted, in order, when no key is stored.
    #[serde(default)]
    pub env_var_names: Vec<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub auth: AuthConfig,
    pub chat: ChatConfig,
    pub parse: ParseConfig,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default)]
    pub api_version: Option<String>,
}

impl ProviderConfig {
    /// Minimal skeleton for providers created through `configure`.
    pub fn custom(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            active: true,
            chat_api_url: None,
            base_url: None,
            models_api_url: None,
            default_model: String::new(),
            env_var_names: Vec::new(),
            api_key: None,
            auth: AuthConfig::bearer(),
            chat: ChatConfig {
                message_format: MessageFormat::OpenAi,
                response_parse_path: "choices[0].message.content".into(),
                tool_schema_type: ToolSchemaType::OpenAi,
            },
            parse: ParseConfig {
                models_path: "data".into(),
                id_field: "id".into(),
                name_field: "id".into(),
                display_name_field: None,
                context_window_field: None,
                id_prefix: None,
            },
            custom_headers: HashMap::new(),
            api_version: None,
        }
    }

    /// Codec dispatch tag for this provider, decided from its chat
    /// config: Anthropic message format selects the Anthropic codec; an
    /// OpenAI-format provider whose response text lives at `response`
    /// speaks the generate-style (Ollama) API.
    pub fn kind(&self) -> ProviderKind {
        match self.chat.message_format {
            MessageFormat::Anthropic => ProviderKind::Anthropic,
            MessageFormat::OpenAi => {
                let path = self.chat.response_parse_path.as_str();
                if path == "response" || path.starts_with("response.") {
                    ProviderKind::Ollama
                } else {
                    ProviderKind::OpenAiCompatible
                }
            }
        }
    }

    /// The chat endpoint: explicit URL, or `base_url` plus the kind's
    /// conventional suffix.
    pub fn chat_url(&self) -> Result<String> {
        if let Some(url) = &self.chat_api_url {
            return Ok(url.clone());
        }
        if let Some(base) = &self.base_url {
            let base = base.trim_end_matches('/');
            let suffix = match self.kind() {
                ProviderKind::Ollama => "/api/generate",
                _ => "/v1/chat/completions",
            };
            return Ok(format!("{base}{suffix}"));
        }
        Err(LlmError::InvalidConfig(format!(
            "provider '{}' has neither chat_api_url nor base_url",
            self.id
        )))
    }

    /// Merge a partial configuration into this one.
    pub fn merge(&mut self, patch: ProviderPatch) {
        if let Some(display_name) = patch.display_name {
            self.display_name = display_name;
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
        if let Some(chat_api_url) = patch.chat_api_url {
            self.chat_api_url = Some(chat_api_url);
        }
        if let Some(base_url) = patch.base_url {
            self.base_url = Some(base_url);
        }
        if let Some(models_api_url) = patch.models_api_url {
            self.models_api_url = Some(models_api_url);
        }
        if let Some(default_model) = patch.default_model {
            self.default_model = default_model;
        }
        if let Some(env_var_names) = patch.env_var_names {
            self.env_var_names = env_var_names;
        }
        if let Some(api_key) = patch.api_key {
            self.api_key = Some(api_key);
        }
        if let Some(auth) = patch.auth {
            self.auth = auth;
        }
        if let Some(chat) = patch.chat {
            self.chat = chat;
        }
        if let Some(parse) = patch.parse {
            self.parse = parse;
        }
        if let Some(custom_headers) = patch.custom_headers {
            self.custom_headers = custom_headers;
        }
        if let Some(api_version) = patch.api_version {
            self.api_version = Some(api_version);
        }
    }
}

/// Partial provider configuration for [`ProviderRegistry::configure`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderPatch {
    pub display_name: Option<String>,
    pub active: Option<bool>,
    pub chat_api_url: Option<String>,
    pub base_url: Option<String>,
    pub models_api_url: Option<String>,
    pub default_model: Option<String>,
    pub env_var_names: Option<Vec<String>>,
    pub api_key: Option<String>,
    pub auth: Option<AuthConfig>,
    pub chat: Option<ChatConfig>,
    pub parse: Option<ParseConfig>,
    pub custom_headers: Option<HashMap<String, String>>,
    pub api_version: Option<String>,
}

impl ProviderPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn chat_api_url(mut self, url: impl Into<String>) -> Self {
        self.chat_api_url = Some(url.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_chat_config() {
        let mut provider = ProviderConfig::custom("x");
        assert_eq!(provider.kind(), ProviderKind::OpenAiCompatible);

        provider.chat.message_format = MessageFormat::Anthropic;
        assert_eq!(provider.kind(), ProviderKind::Anthropic);

        provider.chat.message_format = MessageFormat::OpenAi;
        provider.chat.response_parse_path = "response".into();
        assert_eq!(provider.kind(), ProviderKind::Ollama);
    }

    #[test]
    fn test_chat_url_explicit_wins() {
        let mut provider = ProviderConfig::custom("x");
        provider.base_url = Some("https://example.com".into());
        provider.chat_api_url = Some("https://example.com/custom".into());
        assert_eq!(provider.chat_url().unwrap(), "https://example.com/custom");
    }

    #[test]
    fn test_chat_url_base_suffix_by_kind() {
        let mut provider = ProviderConfig::custom("x");
        provider.base_url = Some("https://example.com/".into());
        assert_eq!(
            provider.chat_url().unwrap(),
            "https://example.com/v1/chat/completions"
        );

        provider.chat.response_parse_path = "response".into();
        assert_eq!(
            provider.chat_url().unwrap(),
            "https://example.com/api/generate"
        );
    }

    #[test]
    fn test_chat_url_missing_is_config_error() {
        let provider = ProviderConfig::custom("x");
        assert!(matches!(
            provider.chat_url(),
            Err(LlmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_merge_patch() {
        let mut provider = ProviderConfig::custom("x");
        provider.merge(ProviderPatch {
            display_name: Some("Example".into()),
            active: Some(false),
            default_model: Some("m-1".into()),
            api_key: Some("sk-test".into()),
            ..ProviderPatch::default()
        });
        assert_eq!(provider.display_name, "Example");
        assert!(!provider.active);
        assert_eq!(provider.default_model, "m-1");
        assert_eq!(provider.api_key.as_deref(), Some("sk-test"));
        // Untouched fields survive.
        assert_eq!(provider.chat.response_parse_path, "choices[0].message.content");
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut provider = ProviderConfig::custom("x");
        provider.api_key = Some("sk-secret".into());
        let serialized = serde_json::to_string(&provider).unwrap();
        assert!(!serialized.contains("sk-secret"));
        assert!(!serialized.contains("api_key"));
    }

    #[test]
    fn test_auth_scheme_serde_shape() {
        let auth = AuthConfig::bearer();
        let value = serde_json::to_value(&auth).unwrap();
        assert_eq!(value["type"], "header");
        assert_eq!(value["format"], "Bearer {key}");

        let query: AuthConfig = serde_json::from_value(serde_json::json!({
            "type": "query",
            "param": "key",
            "optional": true
        }))
        .unwrap();
        assert!(matches!(query.scheme, AuthScheme::Query { ref param } if param == "key"));
        assert!(query.optional);
    }
}
