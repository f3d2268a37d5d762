//! Cross-provider fallback, demonstrated against a scripted transport.
//!
//! Run with: `cargo run --example provider_fallback`
//!
//! The mock transport answers the first call (OpenAI) with 429 and the
//! second (Anthropic) with a success, so the fallback path runs without
//! any network access or API keys beyond the stored test values.

use std::sync::Arc;

use llm_resilience::provider::ProviderPatch;
use llm_resilience::{
    ChatMessage, LlmClient, MockTransport, ProviderRegistry,
};
use llm_resilience::http::MockResponse;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let transport = Arc::new(MockTransport::new(vec![
        MockResponse::new(429, json!({"error": {"message": "rate limited, slow down"}})),
        MockResponse::ok(json!({"content": [{"type": "text", "text": "Hi from Claude"}]})),
    ]));

    let providers = Arc::new(ProviderRegistry::new());
    providers.configure("openai", ProviderPatch::new().api_key("sk-demo"));
    providers.configure("anthropic", ProviderPatch::new().api_key("sk-ant-demo"));

    let client = LlmClient::builder()
        .providers(providers)
        .transport(transport.clone())
        .retries(0) // surface the 429 immediately so fallback kicks in
        .build();

    let reply = client.chat(&[ChatMessage::user("Hello")], None).await?;

    println!("reply: {}", reply.text());
    println!("\ncalls made:");
    for (i, request) in transport.recorded().iter().enumerate() {
        println!("  {}. {}", i + 1, request.url);
    }

    Ok(())
}
