//! Basic chat against a local Ollama instance.
//!
//! Run with: `cargo run --example basic_chat`
//!
//! Requires Ollama running locally with the `llama3.2` model pulled:
//! ```bash
//! ollama pull llama3.2
//! ```

use llm_resilience::{ChatMessage, ChatOptions, LlmClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = LlmClient::builder()
        .service("ollama")
        .timeout(Duration::from_secs(120))
        .retries(2)
        .build();

    println!("Asking llama3.2 a question...\n");

    let reply = client
        .chat(
            &[
                ChatMessage::system("Answer in two sentences."),
                ChatMessage::user("Why is the sky blue?"),
            ],
            Some(ChatOptions::new().with_temperature(0.3)),
        )
        .await?;

    println!("{}", reply.text());

    if let Some(status) = client.breaker_status("ollama") {
        println!(
            "\nbreaker: open={} failures={}/{}",
            status.is_open, status.fail_count, status.failure_threshold
        );
    }

    Ok(())
}
