//! inbox-agent CLI entry point.
//!
//! `run` processes a file of observed emails; `feedback` records what the
//! user ultimately did with one of them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use inbox_agent::behavior::record_feedback;
use inbox_agent::config::AgentConfig;
use inbox_agent::error::ConfigError;
use inbox_agent::llm::{LlmBackend, LlmConfig, create_provider};
use inbox_agent::pipeline::processor::EmailProcessor;
use inbox_agent::source::load_observed;
use inbox_agent::store::{Database, LibSqlBackend};

/// Adaptive email action routing.
#[derive(Parser)]
#[command(name = "inbox-agent", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze, route, and act on observed emails from a JSON or JSON-lines file.
    Run {
        /// Path to the observed-email file.
        input: PathBuf,
    },
    /// Record the user's final action for a processed email.
    Feedback {
        email_id: String,
        /// The user sent a reply.
        #[arg(long)]
        replied: bool,
        /// The user edited the draft before sending.
        #[arg(long)]
        edited: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::from_env().context("failed to load configuration")?;

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    match cli.command {
        Command::Run { input } => handle_run(db, &config, input).await,
        Command::Feedback {
            email_id,
            replied,
            edited,
        } => handle_feedback(db.as_ref(), &email_id, replied, edited).await,
    }
}

async fn handle_run(db: Arc<dyn Database>, config: &AgentConfig, input: PathBuf) -> anyhow::Result<()> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;

    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: secrecy::SecretString::from(api_key),
        model: config.model.clone(),
    })?;

    let emails = load_observed(&input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    info!(count = emails.len(), model = %config.model, "Starting run");

    let processor = EmailProcessor::new(db, llm, config);
    for processed in processor.run_batch(&emails).await {
        println!("{}", serde_json::to_string(&processed)?);
    }
    Ok(())
}

async fn handle_feedback(
    db: &dyn Database,
    email_id: &str,
    replied: bool,
    edited: bool,
) -> anyhow::Result<()> {
    if !record_feedback(db, email_id, replied, edited).await? {
        anyhow::bail!("no processed email with id '{email_id}'");
    }
    println!("Feedback recorded for {email_id}");
    Ok(())
}
