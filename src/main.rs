//! # Remedy Harness CLI (`remedy`)
//!
//! Command-line surface over the recommendation pipeline. Results are printed
//! as JSON on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! remedy --config ./config/remedy.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `remedy recommend "<symptoms>"` | Recommend a remedy (`--attempt N` for follow-ups) |
//! | `remedy chat "<message>"` | Open-ended chat with the active backend |
//! | `remedy index status` | Show vector index freshness and metadata |
//! | `remedy index rebuild` | Force an index rebuild from the knowledge base |
//! | `remedy provider show` | Show the active generation backend |
//! | `remedy provider set <backend>` | Validate and switch the generation backend |
//! | `remedy serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # First attempt, then a follow-up with more detail
//! remedy recommend "j'ai de la fièvre" --config ./config/remedy.toml
//! remedy recommend "fever and chills every evening" --attempt 2
//!
//! # Switch to the open-model backend with an explicit token
//! remedy provider set huggingface --api-key hf_xxxxxxxxxxxxxxxxxxxx
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use remedy_harness::config;
use remedy_harness::models::RecommendationRequest;
use remedy_harness::provider::ProviderId;
use remedy_harness::recommend::Engine;
use remedy_harness::server;

/// Remedy Harness: retrieval-backed herbal remedy recommendations with
/// generated explanations.
#[derive(Parser)]
#[command(
    name = "remedy",
    about = "Remedy Harness: herbal remedy recommendations over a local knowledge base",
    version,
    long_about = "Remedy Harness matches a symptom description to a knowledge-base row \
    (semantic search with lexical fallbacks), then explains the remedy in eight sections using \
    a hosted or open-model text generator, or a deterministic template when none is available."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/remedy.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set (e.g. `info`, `remedy_harness=debug`).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recommend a remedy for a symptom description.
    ///
    /// When nothing matches, the first attempt asks for more details and
    /// later attempts recommend a professional consultation.
    Recommend {
        /// Free-text symptom description.
        query: String,

        /// How many times the user has already asked about these symptoms.
        #[arg(long, default_value_t = 1)]
        attempt: u32,
    },

    /// Chat about herbal medicine with the active backend.
    Chat {
        message: String,
    },

    /// Vector index management.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Generation backend management.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Show whether the persisted index matches the knowledge base.
    Status,
    /// Re-embed every row and replace the persisted index.
    Rebuild,
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Show the active backend and which credentials are available.
    Show,
    /// Validate a credential and make `backend` the active backend.
    Set {
        /// `openai` or `huggingface`.
        backend: String,

        /// Credential to validate; defaults to OPENAI_API_KEY / HF_API_KEY.
        #[arg(long)]
        api_key: Option<String>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Recommend { query, attempt } => {
            let engine = Engine::open(cfg)?;
            engine.start().await;
            let response = engine
                .recommend(&RecommendationRequest {
                    query,
                    attempt_count: attempt,
                })
                .await?;
            print_json(&response)?;
        }
        Commands::Chat { message } => {
            let engine = Engine::open(cfg)?;
            engine.start().await;
            print_json(&engine.chat(&message).await)?;
        }
        Commands::Index { action } => {
            let engine = Engine::open(cfg)?;
            match action {
                IndexAction::Status => print_json(&engine.index_status().await)?,
                IndexAction::Rebuild => print_json(&engine.rebuild_index().await?)?,
            }
        }
        Commands::Provider { action } => {
            let engine = Engine::open(cfg)?;
            match action {
                ProviderAction::Show => {
                    engine.restore_provider().await;
                    print_json(&engine.provider_status().await)?;
                }
                ProviderAction::Set { backend, api_key } => {
                    let id: ProviderId = backend.parse().map_err(anyhow::Error::msg)?;
                    let handle = engine.set_provider(id, api_key.as_deref()).await?;
                    println!("ok: backend switched to {} ({})", handle.id, handle.instance.model());
                }
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
