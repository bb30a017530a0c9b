//! # Context Relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay init` | Create the SQLite database and run schema migrations |
//! | `relay query "<query>"` | Run one retrieval query and print the context bundle |
//! | `relay sources <conversation>` | Show a conversation's carried sources |
//! | `relay pin <conversation> <document>` | Pin (or `--unpin`) a document |
//! | `relay serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! relay init
//! relay query "who develops GPT-4?" --persona research
//! relay query "and DALL-E?" --conversation c-42 --json
//! relay pin c-42 doc-gpt4
//! relay serve
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `context_relay=info`)
//! and always written to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_relay::{config, migrate, query_cmd, server};

/// Context Relay: hybrid retrieval and multi-turn context engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/relay.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Context Relay: hybrid retrieval and multi-turn context engine",
    version,
    long_about = "Context Relay answers natural-language queries against a chunked, embedded \
    corpus with ranked, de-duplicated, citable context bundles, combining keyword search, vector \
    search, knowledge-graph expansion, reranking and cross-turn carry-over."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Run one retrieval query.
    Query {
        /// The query text.
        query: String,

        /// Persona to query as. Defaults to `[server].default_persona`.
        #[arg(long)]
        persona: Option<String>,

        /// Conversation id; enables carry-over between turns.
        #[arg(long)]
        conversation: Option<String>,

        /// Restrict retrieval to these document ids (repeatable).
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Fast mode: no rewriting, HyDE or reranking.
        #[arg(long)]
        fast: bool,

        /// Maximum chunks to return.
        #[arg(long)]
        max_chunks: Option<usize>,

        /// Print the full bundle as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the carried sources of a conversation.
    Sources {
        conversation: String,

        #[arg(long)]
        json: bool,
    },

    /// Pin a document so it is carried on every turn.
    Pin {
        conversation: String,
        document: String,

        /// Remove the pin instead.
        #[arg(long)]
        unpin: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("context_relay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Query {
            query,
            persona,
            conversation,
            documents,
            fast,
            max_chunks,
            json,
        } => {
            query_cmd::run_query(
                &cfg,
                query_cmd::QueryArgs {
                    query,
                    persona,
                    conversation,
                    documents,
                    fast,
                    max_chunks,
                    json,
                },
            )
            .await?;
        }
        Commands::Sources { conversation, json } => {
            query_cmd::run_sources(&cfg, &conversation, json).await?;
        }
        Commands::Pin {
            conversation,
            document,
            unpin,
        } => {
            query_cmd::run_pin(&cfg, &conversation, &document, !unpin).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
