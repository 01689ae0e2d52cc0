//! Minimal example: one tool loop over the current directory.
//!
//! Registers the read-only workspace tools, sends a prompt, and prints the
//! answer with iteration count and cost.
//!
//! # Usage
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run --example basic_agent
//! ```

use corvid::prelude::*;
use corvid::tools::{ListFiles, ReadFile, SearchCode};

#[tokio::main]
async fn main() -> Result<(), corvid::Error> {
    // 1. Client with the built-in provider table and env-var keys.
    let config = CoreConfig::load(None)?.apply_env_overrides();
    let client = ProviderClient::from_config(&config)?;

    // 2. Tools the model can call.
    let tools = ToolSet::new()
        .with(ReadFile::new("."))
        .with(ListFiles::new("."))
        .with(SearchCode::new("."));

    // 3. Run the loop.
    let messages = vec![
        Message::system("You are a helpful coding assistant. Be concise."),
        Message::user("List the files in the current directory and summarize what this project does."),
    ];
    let result = ToolLoop::new(&client, &tools, LoopConfig::new("gpt-4.1").with_max_iterations(10))
        .with_event_handler(&LoggingHandler)
        .run(messages)
        .await?;

    // 4. Print results.
    println!("\n{}", result.content);
    println!(
        "\n--- {} iteration(s) | {} tool call(s) | {} ---",
        result.iterations,
        result.tool_calls.len(),
        result.cost.summary()
    );

    Ok(())
}
