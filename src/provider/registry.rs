//! Process-wide provider directory.
//!
//! Seeded with built-ins (OpenAI, Anthropic, Google's OpenAI-compatible
//! Gemini endpoint, Ollama); mutated through partial-config merges.
//! Reads hand out clones, so callers never observe a torn record, and
//! stored API keys never serialize back out.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::parse_path;
use super::{
    AuthConfig, AuthScheme, ChatConfig, MessageFormat, ParseConfig, ProviderConfig, ProviderPatch,
    ToolSchemaType,
};
use crate::error::{LlmError, Result};

/// Uniform model record projected from a provider's model list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub display_name: Option<String>,
    pub context_window: Option<u64>,
}

/// Directory of provider configurations.
pub struct ProviderRegistry {
    providers: Mutex<HashMap<String, ProviderConfig>>,
    /// Seed-then-insertion order; drives fallback candidate selection.
    order: Mutex<Vec<String>>,
    model_cache: Mutex<HashMap<String, Vec<ModelInfo>>>,
    client: reqwest::Client,
}

impl ProviderRegistry {
    /// A registry seeded with the built-in providers.
    pub fn new() -> Self {
        let registry = Self {
            providers: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            model_cache: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
        };
        for provider in builtins() {
            registry.insert(provider);
        }
        registry
    }

    fn insert(&self, provider: ProviderConfig) {
        let mut providers = self.providers.lock().unwrap();
        if !providers.contains_key(&provider.id) {
            self.order.lock().unwrap().push(provider.id.clone());
        }
        providers.insert(provider.id.clone(), provider);
    }

    /// Fetch one provider's configuration (a clone; keys included for
    /// in-process use, but they never survive serialization).
    pub fn get(&self, id: &str) -> Option<ProviderConfig> {
        self.providers.lock().unwrap().get(id).cloned()
    }

    /// Provider ids in seed-then-insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    /// All provider configurations, in registry order.
    pub fn list(&self) -> Vec<ProviderConfig> {
        let providers = self.providers.lock().unwrap();
        self.order
            .lock()
            .unwrap()
            .iter()
            .filter_map(|id| providers.get(id).cloned())
            .collect()
    }

    /// Merge a partial configuration into `id`, creating the provider
    /// from a skeleton when absent.
    pub fn configure(&self, id: &str, patch: ProviderPatch) {
        let mut providers = self.providers.lock().unwrap();
        match providers.get_mut(id) {
            Some(existing) => existing.merge(patch),
            None => {
                let mut created = ProviderConfig::custom(id);
                created.merge(patch);
                self.order.lock().unwrap().push(id.to_string());
                providers.insert(id.to_string(), created);
                debug!(provider = id, "created provider from patch");
            }
        }
    }

    /// Resolve the API key for a call: per-call override, then the
    /// stored key, then the first non-empty configured environment
    /// variable.
    ///
    /// Returns `Ok(None)` when the provider's auth is optional and no
    /// key was found; [`LlmError::AuthMissing`] when one is required.
    pub fn resolve_api_key(&self, id: &str, per_call: Option<&str>) -> Result<Option<String>> {
        let provider = self
            .get(id)
            .ok_or_else(|| LlmError::InvalidProvider(id.to_string()))?;

        if let Some(key) = per_call {
            return Ok(Some(key.to_string()));
        }
        if let Some(key) = provider.api_key {
            return Ok(Some(key));
        }
        for var in &provider.env_var_names {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    return Ok(Some(value));
                }
            }
        }
        if provider.auth.optional {
            Ok(None)
        } else {
            Err(LlmError::AuthMissing(id.to_string()))
        }
    }

    /// Add the provider's auth and custom headers to `base`.
    ///
    /// Query-style auth contributes nothing here; see
    /// [`build_api_url`](Self::build_api_url).
    pub fn build_auth_headers(
        &self,
        id: &str,
        key: Option<&str>,
        base: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let provider = self
            .get(id)
            .ok_or_else(|| LlmError::InvalidProvider(id.to_string()))?;

        let mut headers = base;
        for (name, value) in &provider.custom_headers {
            headers.insert(name.clone(), value.clone());
        }
        if let (AuthScheme::Header { name, format }, Some(key)) = (&provider.auth.scheme, key) {
            headers.insert(name.clone(), format.replace("{key}", key));
        }
        Ok(headers)
    }

    /// Augment `url` with the provider's query-style auth, when that is
    /// its scheme.
    pub fn build_api_url(&self, id: &str, url: &str, key: Option<&str>) -> String {
        let Some(provider) = self.get(id) else {
            return url.to_string();
        };
        if let (AuthScheme::Query { param }, Some(key)) = (&provider.auth.scheme, key) {
            let separator = if url.contains('?') { '&' } else { '?' };
            return format!("{url}{separator}{param}={key}");
        }
        url.to_string()
    }

    /// List the provider's models, projected into [`ModelInfo`] records
    /// and cached per provider.
    pub async fn models(&self, id: &str, api_key: Option<&str>) -> Result<Vec<ModelInfo>> {
        if let Some(cached) = self.model_cache.lock().unwrap().get(id) {
            return Ok(cached.clone());
        }

        let provider = self
            .get(id)
            .ok_or_else(|| LlmError::InvalidProvider(id.to_string()))?;
        let url = provider.models_api_url.clone().ok_or_else(|| {
            LlmError::InvalidConfig(format!("provider '{id}' has no models_api_url"))
        })?;

        let key = self.resolve_api_key(id, api_key)?;
        let headers = self.build_auth_headers(id, key.as_deref(), HashMap::new())?;
        let url = self.build_api_url(id, &url, key.as_deref());

        let mut request = self.client.get(&url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body: Value = response.json().await?;
        if !(200..300).contains(&status) {
            return Err(LlmError::Http {
                status,
                body: crate::http::provider_message(&body),
                retry_after: None,
            });
        }

        let models = project_models(&provider.parse, &body);
        self.model_cache
            .lock()
            .unwrap()
            .insert(id.to_string(), models.clone());
        Ok(models)
    }

    /// Drop cached model lists for one provider, or for all of them.
    pub fn clear_models_cache(&self, id: Option<&str>) {
        let mut cache = self.model_cache.lock().unwrap();
        match id {
            Some(id) => {
                cache.remove(id);
            }
            None => cache.clear(),
        }
    }

    #[cfg(test)]
    pub(crate) fn prime_models_cache(&self, id: &str, models: Vec<ModelInfo>) {
        self.model_cache
            .lock()
            .unwrap()
            .insert(id.to_string(), models);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

/// Project a raw model-list body through a provider's [`ParseConfig`].
pub fn project_models(config: &ParseConfig, body: &Value) -> Vec<ModelInfo> {
    let Some(records) = parse_path::walk(body, &config.models_path).and_then(Value::as_array)
    else {
        return Vec::new();
    };
    records
        .iter()
        .filter_map(|record| {
            let id = record.get(&config.id_field)?.as_str()?.to_string();
            if let Some(prefix) = &config.id_prefix {
                if !id.starts_with(prefix.as_str()) {
                    return None;
                }
            }
            let name = record
                .get(&config.name_field)
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();
            let display_name = config
                .display_name_field
                .as_ref()
                .and_then(|field| record.get(field))
                .and_then(Value::as_str)
                .map(String::from);
            let context_window = config
                .context_window_field
                .as_ref()
                .and_then(|field| record.get(field))
                .and_then(Value::as_u64);
            Some(ModelInfo {
                id,
                name,
                display_name,
                context_window,
            })
        })
        .collect()
}

/// The built-in provider seeds.
fn builtins() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            id: "openai".into(),
            display_name: "OpenAI".into(),
            active: true,
            chat_api_url: Some("https://api.openai.com/v1/chat/completions".into()),
            base_url: None,
            models_api_url: Some("https://api.openai.com/v1/models".into()),
            default_model: "gpt-4o".into(),
            env_var_names: vec!["OPENAI_API_KEY".into()],
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
                id_prefix: Some("gpt-".into()),
            },
            custom_headers: HashMap::new(),
            api_version: None,
        },
        ProviderConfig {
            id: "anthropic".into(),
            display_name: "Anthropic".into(),
            active: true,
            chat_api_url: Some("https://api.anthropic.com/v1/messages".into()),
            base_url: None,
            models_api_url: Some("https://api.anthropic.com/v1/models".into()),
            default_model: "claude-3-5-sonnet-20241022".into(),
            env_var_names: vec!["ANTHROPIC_API_KEY".into()],
            api_key: None,
            auth: AuthConfig {
                scheme: AuthScheme::Header {
                    name: "x-api-key".into(),
                    format: "{key}".into(),
                },
                optional: false,
            },
            chat: ChatConfig {
                message_format: MessageFormat::Anthropic,
                response_parse_path: "content[0].text".into(),
                tool_schema_type: ToolSchemaType::Anthropic,
            },
            parse: ParseConfig {
                models_path: "data".into(),
                id_field: "id".into(),
                name_field: "id".into(),
                display_name_field: Some("display_name".into()),
                context_window_field: None,
                id_prefix: None,
            },
            custom_headers: HashMap::from([(
                "anthropic-version".to_string(),
                "2023-06-01".to_string(),
            )]),
            api_version: Some("2023-06-01".into()),
        },
        ProviderConfig {
            id: "google".into(),
            display_name: "Google Gemini".into(),
            active: true,
            chat_api_url: Some(
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions".into(),
            ),
            base_url: None,
            models_api_url: Some(
                "https://generativelanguage.googleapis.com/v1beta/openai/models".into(),
            ),
            default_model: "gemini-2.0-flash".into(),
            env_var_names: vec!["GEMINI_API_KEY".into(), "GOOGLE_API_KEY".into()],
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
        },
        ProviderConfig {
            id: "ollama".into(),
            display_name: "Ollama".into(),
            active: true,
            chat_api_url: None,
            base_url: Some("http://localhost:11434".into()),
            models_api_url: Some("http://localhost:11434/api/tags".into()),
            default_model: "llama3.2".into(),
            env_var_names: Vec::new(),
            api_key: None,
            auth: AuthConfig {
                scheme: AuthScheme::Header {
                    name: "Authorization".into(),
                    format: "Bearer {key}".into(),
                },
                optional: true,
            },
            chat: ChatConfig {
                message_format: MessageFormat::OpenAi,
                response_parse_path: "response".into(),
                tool_schema_type: ToolSchemaType::OpenAi,
            },
            parse: ParseConfig {
                models_path: "models".into(),
                id_field: "name".into(),
                name_field: "name".into(),
                display_name_field: None,
                context_window_field: None,
                id_prefix: None,
            },
            custom_headers: HashMap::new(),
            api_version: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use serde_json::json;

    #[test]
    fn test_seeded_with_builtins_in_order() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.ids(), vec!["openai", "anthropic", "google", "ollama"]);
        assert!(registry.get("openai").is_some());
        assert!(registry.get("mistral").is_none());
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.get("openai").unwrap().kind(),
            ProviderKind::OpenAiCompatible
        );
        assert_eq!(
            registry.get("anthropic").unwrap().kind(),
            ProviderKind::Anthropic
        );
        assert_eq!(registry.get("ollama").unwrap().kind(), ProviderKind::Ollama);
    }

    #[test]
    fn test_ollama_chat_url_from_base() {
        let registry = ProviderRegistry::new();
        assert_eq!(
            registry.get("ollama").unwrap().chat_url().unwrap(),
            "http://localhost:11434/api/generate"
        );
    }

    #[test]
    fn test_configure_merges_existing() {
        let registry = ProviderRegistry::new();
        registry.configure("openai", ProviderPatch::new().default_model("gpt-4.1"));
        let provider = registry.get("openai").unwrap();
        assert_eq!(provider.default_model, "gpt-4.1");
        // Everything else untouched.
        assert_eq!(provider.display_name, "OpenAI");
    }

    #[test]
    fn test_configure_creates_absent_provider() {
        let registry = ProviderRegistry::new();
        registry.configure(
            "groq",
            ProviderPatch::new()
                .base_url("https://api.groq.com/openai")
                .default_model("llama-3.1-70b"),
        );
        let provider = registry.get("groq").unwrap();
        assert_eq!(provider.default_model, "llama-3.1-70b");
        assert!(provider.active);
        assert_eq!(registry.ids().last().map(String::as_str), Some("groq"));
    }

    #[test]
    fn test_resolve_key_precedence() {
        let registry = ProviderRegistry::new();
        registry.configure("openai", ProviderPatch::new().api_key("sk-stored"));

        // Per-call override wins over the stored key.
        let key = registry.resolve_api_key("openai", Some("sk-call")).unwrap();
        assert_eq!(key.as_deref(), Some("sk-call"));

        let key = registry.resolve_api_key("openai", None).unwrap();
        assert_eq!(key.as_deref(), Some("sk-stored"));
    }

    #[test]
    fn test_resolve_key_from_env() {
        let registry = ProviderRegistry::new();
        registry.configure(
            "envtest",
            ProviderPatch {
                env_var_names: Some(vec!["LLM_RESILIENCE_TEST_KEY".into()]),
                ..ProviderPatch::default()
            },
        );
        std::env::set_var("LLM_RESILIENCE_TEST_KEY", "sk-env");
        let key = registry.resolve_api_key("envtest", None).unwrap();
        assert_eq!(key.as_deref(), Some("sk-env"));
        std::env::remove_var("LLM_RESILIENCE_TEST_KEY");
    }

    #[test]
    fn test_resolve_key_required_but_missing() {
        let registry = ProviderRegistry::new();
        registry.configure(
            "keyless",
            ProviderPatch {
                env_var_names: Some(Vec::new()),
                ..ProviderPatch::default()
            },
        );
        assert!(matches!(
            registry.resolve_api_key("keyless", None),
            Err(LlmError::AuthMissing(_))
        ));
    }

    #[test]
    fn test_resolve_key_optional_none() {
        let registry = ProviderRegistry::new();
        let key = registry.resolve_api_key("ollama", None).unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn test_resolve_key_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve_api_key("nope", None),
            Err(LlmError::InvalidProvider(_))
        ));
    }

    #[test]
    fn test_auth_headers_bearer() {
        let registry = ProviderRegistry::new();
        let headers = registry
            .build_auth_headers("openai", Some("sk-test"), HashMap::new())
            .unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-test");
    }

    #[test]
    fn test_auth_headers_anthropic_key_and_version() {
        let registry = ProviderRegistry::new();
        let headers = registry
            .build_auth_headers("anthropic", Some("sk-ant"), HashMap::new())
            .unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn test_auth_headers_keep_base_entries() {
        let registry = ProviderRegistry::new();
        let base = HashMap::from([("x-custom".to_string(), "1".to_string())]);
        let headers = registry
            .build_auth_headers("openai", Some("sk"), base)
            .unwrap();
        assert_eq!(headers.get("x-custom").unwrap(), "1");
    }

    #[test]
    fn test_query_auth_augments_url() {
        let registry = ProviderRegistry::new();
        registry.configure(
            "queryauth",
            ProviderPatch {
                auth: Some(AuthConfig {
                    scheme: AuthScheme::Query {
                        param: "key".into(),
                    },
                    optional: false,
                }),
                ..ProviderPatch::default()
            },
        );
        assert_eq!(
            registry.build_api_url("queryauth", "https://x.test/v1", Some("abc")),
            "https://x.test/v1?key=abc"
        );
        assert_eq!(
            registry.build_api_url("queryauth", "https://x.test/v1?a=1", Some("abc")),
            "https://x.test/v1?a=1&key=abc"
        );
        // Header-auth providers leave the URL alone.
        assert_eq!(
            registry.build_api_url("openai", "https://x.test/v1", Some("abc")),
            "https://x.test/v1"
        );
    }

    #[test]
    fn test_project_models_openai_shape() {
        let config = ParseConfig {
            models_path: "data".into(),
            id_field: "id".into(),
            name_field: "id".into(),
            display_name_field: None,
            context_window_field: None,
            id_prefix: Some("gpt-".into()),
        };
        let body = json!({"data": [
            {"id": "gpt-4o", "object": "model"},
            {"id": "whisper-1", "object": "model"},
            {"id": "gpt-4.1", "object": "model"},
        ]});
        let models = project_models(&config, &body);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "gpt-4o");
        assert_eq!(models[1].id, "gpt-4.1");
    }

    #[test]
    fn test_project_models_with_display_and_context() {
        let config = ParseConfig {
            models_path: "data".into(),
            id_field: "id".into(),
            name_field: "id".into(),
            display_name_field: Some("display_name".into()),
            context_window_field: Some("context_window".into()),
            id_prefix: None,
        };
        let body = json!({"data": [
            {"id": "claude-3-5-sonnet-20241022", "display_name": "Claude 3.5 Sonnet", "context_window": 200000},
        ]});
        let models = project_models(&config, &body);
        assert_eq!(models[0].display_name.as_deref(), Some("Claude 3.5 Sonnet"));
        assert_eq!(models[0].context_window, Some(200_000));
    }

    #[test]
    fn test_project_models_missing_path_is_empty() {
        let config = ParseConfig {
            models_path: "data".into(),
            id_field: "id".into(),
            name_field: "id".into(),
            display_name_field: None,
            context_window_field: None,
            id_prefix: None,
        };
        assert!(project_models(&config, &json!({"models": []})).is_empty());
    }

    #[tokio::test]
    async fn test_models_served_from_cache() {
        let registry = ProviderRegistry::new();
        registry.prime_models_cache(
            "openai",
            vec![ModelInfo {
                id: "gpt-4o".into(),
                name: "gpt-4o".into(),
                display_name: None,
                context_window: None,
            }],
        );
        // No HTTP happens: the cache answers.
        let models = registry.models("openai", None).await.unwrap();
        assert_eq!(models.len(), 1);

        registry.clear_models_cache(Some("openai"));
        // Now the call would need HTTP and a key; a missing key surfaces
        // AuthMissing before any request is attempted.
        std::env::remove_var("OPENAI_API_KEY");
        assert!(matches!(
            registry.models("openai", None).await,
            Err(LlmError::AuthMissing(_))
        ));
    }

    #[test]
    fn test_clear_all_model_caches() {
        let registry = ProviderRegistry::new();
        registry.prime_models_cache("openai", Vec::new());
        registry.prime_models_cache("anthropic", Vec::new());
        registry.clear_models_cache(None);
        // Both gone: a subsequent models() would have to fetch. Verified
        // indirectly through the cache map being empty.
        assert!(registry.model_cache.lock().unwrap().is_empty());
    }

    #[test]
    fn test_list_preserves_order_and_hides_keys() {
        let registry = ProviderRegistry::new();
        registry.configure("openai", ProviderPatch::new().api_key("sk-secret"));
        let listed = registry.list();
        assert_eq!(listed[0].id, "openai");
        let serialized = serde_json::to_string(&listed).unwrap();
        assert!(!serialized.contains("sk-secret"));
    }
}
