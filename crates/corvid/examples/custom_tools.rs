//! Custom tools example: typed `FnTool`s, per-tool quotas and composed
//! event handlers, run inside a persisted thread.
//!
//! Demonstrates:
//! - Typed argument structs with `Deserialize` + `JsonSchema`
//! - Conditional registration with `ToolSet::with_if`
//! - Quotas from `CoreConfig::quotas`
//! - `CompositeEventHandler` with a closure handler
//!
//! # Usage
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run --example custom_tools
//! ```

use std::sync::Arc;

use corvid::prelude::*;
use schemars::JsonSchema;
use serde::Deserialize;

// ── Typed argument structs ──────────────────────────────────────────

/// Arguments for the `lookup_symbol` tool.
#[derive(Deserialize, JsonSchema)]
struct LookupSymbolArgs {
    /// Symbol name, e.g. 'ProviderClient'.
    symbol: String,
}

/// Arguments for the `web_search` tool.
#[derive(Deserialize, JsonSchema)]
struct WebSearchArgs {
    /// Search query.
    query: String,
}

// ── Tool constructors ───────────────────────────────────────────────

fn lookup_symbol_tool() -> FnTool {
    let def = ToolDef::new(
        "lookup_symbol",
        "Find where a Rust symbol is defined. Use before reading files when the user names a type or function.",
        json_schema_for::<LookupSymbolArgs>(),
    );
    FnTool::new(def, |args: LookupSymbolArgs| async move {
        // A real tool would consult an index.
        Ok(format!("{} is defined in src/api/client.rs", args.symbol))
    })
}

fn web_search_tool() -> FnTool {
    let def = ToolDef::new(
        "web_search",
        "Search the web. Use only for questions the workspace cannot answer.",
        json_schema_for::<WebSearchArgs>(),
    );
    FnTool::new(def, |args: WebSearchArgs| async move {
        if args.query.trim().is_empty() {
            return Err(ToolError::failed("empty query"));
        }
        Ok(format!("[stub] no results for '{}'", args.query))
    })
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), corvid::Error> {
    let mut config = CoreConfig::load(None)?.apply_env_overrides();
    config.quotas.insert("web_search".into(), 2);
    let client = ProviderClient::from_config(&config)?;

    let search_enabled = std::env::var("CORVID_NO_SEARCH").is_err();
    let tools = ToolSet::new()
        .with(lookup_symbol_tool())
        .with_if(search_enabled, web_search_tool());

    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(FnEventHandler::new(|event: &LoopEvent<'_>| {
            if let LoopEvent::ToolResult { name, result, .. } = event {
                eprintln!("[callback] {name} -> {} bytes", result.len());
            }
        }));

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let context = ContextWindowManager::from_config(storage, &client, &config);
    let conversation = Conversation::new(&client, &context, &tools, &config)
        .with_system_prompt("You answer questions about the corvid codebase.")
        .with_event_handler(&handler);

    let thread = conversation.start_thread("demo", None, "symbols").await?;
    let turn = conversation
        .respond(&thread.id, "Where is ProviderClient defined, and what does it do?")
        .await?;

    println!("\n{}", turn.result.content);
    println!(
        "\n--- {} iteration(s) | {} message(s) stored | {} ---",
        turn.result.iterations,
        turn.persisted.len(),
        turn.result.cost.summary()
    );

    Ok(())
}
