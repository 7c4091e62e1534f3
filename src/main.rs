// ABOUTME: CLI entry point for warehouse-replicator
// ABOUTME: Parses commands, loads configuration, and routes to the command handlers

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use warehouse_replicator::commands;
use warehouse_replicator::config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "warehouse-replicator")]
#[command(about = "Incremental MySQL-to-warehouse table replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured mapping once
    RunOnce,
    /// Run every mapping on the configured cron schedule until Ctrl+C
    Schedule,
    /// Re-load a window of one mapping without moving its watermark
    Backfill {
        /// Name of the mapping to backfill
        #[arg(long)]
        mapping: String,
        /// Inclusive lower bound on the incremental column
        #[arg(long)]
        start: String,
        /// Inclusive upper bound on the incremental column
        #[arg(long)]
        end: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::RunOnce => {
            commands::run_once(&config).await?;
        }
        Commands::Schedule => {
            commands::schedule(&config).await?;
        }
        Commands::Backfill {
            mapping,
            start,
            end,
        } => {
            commands::backfill(&config, &mapping, &start, end.as_deref()).await?;
        }
    }

    Ok(())
}
