mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use strata::config::StrataConfig;

#[derive(Parser)]
#[command(name = "strata", version, about = "Sector-aware long-term memory for AI agents")]
struct Cli {
    /// Config file (defaults to ~/.strata/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the store and run background maintenance until ctrl-c
    Serve,
    /// Run every maintenance job once
    Maintain {
        #[arg(long)]
        json: bool,
    },
    /// Show store statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Store a memory
    Remember {
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
        /// JSON object, e.g. '{"sector":"procedural"}'
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Query memories
    Recall {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long = "sector")]
        sectors: Vec<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        min_salience: Option<f64>,
    },
    /// Boost a memory's salience
    Reinforce {
        id: String,
        #[arg(long)]
        boost: Option<f64>,
    },
    /// Delete a memory and its links
    Forget { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StrataConfig::load_from(path)?,
        None => StrataConfig::load()?,
    };

    // Log to stderr so stdout stays clean for JSON output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => cli::serve(config).await?,
        Command::Maintain { json } => cli::maintenance::maintain(config, json).await?,
        Command::Stats { json } => cli::stats::stats(config, json).await?,
        Command::Remember {
            content,
            tags,
            owner,
            metadata,
        } => cli::memory::remember(config, content, tags, owner, metadata).await?,
        Command::Recall {
            query,
            k,
            sectors,
            owner,
            min_salience,
        } => cli::memory::recall(config, query, k, sectors, owner, min_salience).await?,
        Command::Reinforce { id, boost } => cli::memory::reinforce(config, id, boost).await?,
        Command::Forget { id } => cli::memory::forget(config, id).await?,
    }

    Ok(())
}
