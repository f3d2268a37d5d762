//! Request-keyed response caching.
//!
//! Cache keys are the SHA-256 of the fully-formed request: URL bytes,
//! the canonical JSON of the body, and the canonical JSON of the
//! headers. Only 200 responses are ever written; TTL and eviction are
//! the store owner's concern, not this crate's.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A cached provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Parsed response body.
    pub data: Value,
    /// HTTP status code; always 200 for entries written by the engine.
    pub status: u16,
}

/// Caller-supplied keyed store.
///
/// Last-write-wins is acceptable: identical keys hold identical content.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;
    async fn put(&self, key: &str, value: CachedResponse);
}

/// Derive the cache key for a request.
///
/// `serde_json`'s default map keeps keys sorted, so serializing the body
/// yields canonical JSON; headers are sorted explicitly before
/// serialization.
pub fn cache_key(url: &str, body: &Value, headers: &HashMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(serde_json::to_vec(body).unwrap_or_default());
    let sorted: BTreeMap<&str, &str> = headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    hasher.update(serde_json::to_vec(&sorted).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// In-memory reference store.
///
/// `std::sync::Mutex` (not tokio): never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    async fn put(&self, key: &str, value: CachedResponse) {
        self.entries.lock().unwrap().insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_is_deterministic() {
        let body = json!({"model": "gpt-4o", "messages": []});
        let h = headers(&[("Authorization", "Bearer sk-test")]);
        let k1 = cache_key("https://api.openai.com/v1/chat/completions", &body, &h);
        let k2 = cache_key("https://api.openai.com/v1/chat/completions", &body, &h);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn test_key_ignores_header_insertion_order() {
        let body = json!({"model": "gpt-4o"});
        let h1 = headers(&[("a", "1"), ("b", "2")]);
        let h2 = headers(&[("b", "2"), ("a", "1")]);
        assert_eq!(cache_key("u", &body, &h1), cache_key("u", &body, &h2));
    }

    #[test]
    fn test_key_varies_with_each_component() {
        let body = json!({"model": "gpt-4o"});
        let h = headers(&[("a", "1")]);
        let base = cache_key("u", &body, &h);

        assert_ne!(base, cache_key("u2", &body, &h));
        assert_ne!(base, cache_key("u", &json!({"model": "gpt-4.1"}), &h));
        assert_ne!(base, cache_key("u", &body, &headers(&[("a", "2")])));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCacheStore::new();
        assert!(store.get("k").await.is_none());

        let value = CachedResponse {
            data: json!({"choices": []}),
            status: 200,
        };
        store.put("k", value.clone()).await;
        assert_eq!(store.get("k").await, Some(value));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let store = MemoryCacheStore::new();
        store
            .put(
                "k",
                CachedResponse {
                    data: json!(1),
                    status: 200,
                },
            )
            .await;
        store
            .put(
                "k",
                CachedResponse {
                    data: json!(2),
                    status: 200,
                },
            )
            .await;
        assert_eq!(store.get("k").await.unwrap().data, json!(2));
        assert_eq!(store.len(), 1);
    }
}
