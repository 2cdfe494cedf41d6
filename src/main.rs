//! # PDF RAG CLI (`pdf-rag`)
//!
//! ## Usage
//!
//! ```bash
//! pdf-rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdf-rag serve` | Start the HTTP server |
//! | `pdf-rag index <file>` | Index a document into a new session and print its id |
//! | `pdf-rag ask <session_id> "<question>"` | Answer one question from a saved index |

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pdf_rag::chain::Binder;
use pdf_rag::config::{self, Config};
use pdf_rag::embedding::create_embedder;
use pdf_rag::indexer::Indexer;
use pdf_rag::llm::create_chat_model;
use pdf_rag::models::SourceRef;
use pdf_rag::server;

/// PDF RAG: chat with an uploaded PDF.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "pdf-rag",
    about = "Upload a PDF, index it for semantic search, and chat with it over HTTP",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`. Requires `OPENAI_API_KEY` when an OpenAI
    /// provider is configured.
    Serve,

    /// Index a document synchronously into a new session.
    ///
    /// The saved index can be queried with `ask` or through `/chat` on a
    /// server sharing the same storage directories.
    Index {
        /// PDF (or `.txt`/`.md`) file to index.
        file: PathBuf,
    },

    /// Answer one question against a session's saved index.
    Ask {
        /// Session id printed by `index` or returned by `/upload`.
        session_id: String,
        /// The question.
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Index { file } => {
            run_index(&cfg, &file).await?;
        }
        Commands::Ask {
            session_id,
            question,
        } => {
            run_ask(&cfg, &session_id, &question).await?;
        }
    }

    Ok(())
}

async fn run_index(cfg: &Config, file: &std::path::Path) -> anyhow::Result<()> {
    config::require_api_key(cfg)?;
    let embedder = create_embedder(&cfg.embedding)?;
    let indexer = Indexer::new(cfg, embedder);

    let session_id = Uuid::new_v4().to_string();
    let index = indexer
        .index_file(&session_id, file)
        .await
        .with_context(|| format!("failed to index {}", file.display()))?;

    eprintln!(
        "indexed {} chunks into {}",
        index.len(),
        cfg.storage.index_dir(&session_id).display()
    );
    println!("{}", session_id);
    Ok(())
}

async fn run_ask(cfg: &Config, session_id: &str, question: &str) -> anyhow::Result<()> {
    config::require_api_key(cfg)?;
    let binder = Binder::new(
        cfg,
        create_embedder(&cfg.embedding)?,
        create_chat_model(&cfg.llm)?,
    );
    let chain = binder
        .rehydrate(session_id)
        .await?
        .with_context(|| format!("no saved index for session {}", session_id))?;

    let result = chain.ask(question).await?;
    println!("{}", result.answer);
    if !result.sources.is_empty() {
        println!();
        println!("Sources:");
        for s in &result.sources {
            let src = SourceRef::from_chunk(&s.chunk, cfg.retrieval.preview_chars);
            println!("  [page {}] (score {:.3}) {}", src.page, s.score, src.text);
        }
    }
    Ok(())
}
