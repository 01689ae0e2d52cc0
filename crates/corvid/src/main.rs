//! Command-line front end for corvid.
//!
//! Threads are stored as JSON files under the configured `storage_dir`.
//! API keys come from each provider's environment variable
//! (`OPENAI_API_KEY`, `GEMINI_API_KEY`, ...).
//!
//! # Examples
//!
//! ```sh
//! # Start a thread and ask a question about the current directory
//! corvid ask --new --title "retry audit" "Where is the retry policy defined?"
//!
//! # Continue a thread with a different model
//! corvid ask --thread th-18c2f3a1b-0000 --model gemini-2.5-pro "Now modify src/api/retry.rs"
//!
//! # Inspect stored state
//! corvid threads --user me
//! corvid history th-18c2f3a1b-0000 --limit 20
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use corvid::prelude::*;
use corvid::tools::{ListFiles, ReadFile, SearchCode};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SYSTEM_PROMPT: &str = "You are a coding assistant working in the user's repository. \
Use the tools to read and search files before answering. Cite file paths in your answers.";

/// Runtime core for LLM coding agents.
#[derive(Parser)]
#[command(name = "corvid", version)]
struct Cli {
    /// JSON config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a query inside a thread, using workspace tools.
    Ask {
        /// Query text.
        query: String,

        /// Existing thread id.
        #[arg(long, conflicts_with = "new")]
        thread: Option<String>,

        /// Start a new thread for this query.
        #[arg(long)]
        new: bool,

        /// Title for a new thread.
        #[arg(long, default_value = "untitled")]
        title: String,

        /// Owner of a new thread.
        #[arg(long, default_value = "local")]
        user: String,

        /// Model override for this turn.
        #[arg(long)]
        model: Option<String>,

        /// Workspace root the tools operate in.
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
    },
    /// List threads owned by a user.
    Threads {
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Print the stored messages of a thread.
    History {
        thread: String,

        /// Only the most recent N messages.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corvid=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), corvid::Error> {
    let config = CoreConfig::load(cli.config.as_deref())?.apply_env_overrides();
    let client = ProviderClient::from_config(&config)?;
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&config.storage_dir)?);
    let context = ContextWindowManager::from_config(storage, &client, &config);

    match cli.command {
        Command::Ask {
            query,
            thread,
            new,
            title,
            user,
            model,
            workdir,
        } => {
            let workdir = std::fs::canonicalize(&workdir).unwrap_or(workdir);
            let tools = ToolSet::new()
                .with(ReadFile::new(&workdir))
                .with(ListFiles::new(&workdir))
                .with(SearchCode::new(&workdir));
            let mut loop_config = config.loop_config();
            if let Some(model) = model {
                loop_config.model = model;
            }
            let conversation = Conversation::new(&client, &context, &tools, &config)
                .with_system_prompt(SYSTEM_PROMPT)
                .with_loop_config(loop_config)
                .with_event_handler(&LoggingHandler);

            let thread_id = match thread {
                Some(id) if !new => id,
                _ => {
                    let project = workdir.to_string_lossy();
                    let thread = conversation
                        .start_thread(&user, Some(project.as_ref()), &title)
                        .await?;
                    eprintln!("Thread: {}", thread.id);
                    thread.id
                }
            };

            let turn = conversation.respond(&thread_id, &query).await?;
            println!("{}", turn.result.content);
            eprintln!(
                "[{} iteration(s), {} tool call(s), {} failed{}; {}]",
                turn.result.iterations,
                turn.result.tool_calls.len(),
                turn.result.failed_calls().count(),
                if turn.result.forced_finalization {
                    ", forced"
                } else {
                    ""
                },
                turn.result.cost.summary()
            );
        }
        Command::Threads { user } => {
            let tools = ToolSet::new();
            let conversation = Conversation::new(&client, &context, &tools, &config);
            for thread in conversation.threads(&user).await? {
                println!(
                    "{}  {}  {} message(s), {} tokens  {}",
                    thread.id,
                    thread.updated_at.format("%Y-%m-%d %H:%M"),
                    thread.message_count,
                    thread.total_tokens,
                    thread.title
                );
            }
        }
        Command::History { thread, limit } => {
            let tools = ToolSet::new();
            let conversation = Conversation::new(&client, &context, &tools, &config);
            for message in conversation.history(&thread, limit).await? {
                println!("[{}] {}", message.role, message.content);
            }
        }
    }
    Ok(())
}
