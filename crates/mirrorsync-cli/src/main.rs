//! MirrorSync CLI - Command-line interface for MirrorSync
//!
//! Provides commands for:
//! - Running a replication session against the configured target
//! - Rolling a failed session back from its pre-sync snapshots
//! - Applying snapshot retention cleanup
//!
//! Exit codes: 0 on success, 130 when the session was interrupted, 1 for
//! any other failure.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{cleanup::CleanupCommand, rollback::RollbackCommand, sync::SyncCommand};
use mirrorsync_core::config::Config;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "mirrorsync",
    version,
    about = "Snapshot-protected one-way machine replication over SSH"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one replication session against the configured target
    Sync(SyncCommand),
    /// Restore the target's subvolumes from a session's pre-sync snapshots
    Rollback(RollbackCommand),
    /// Delete old snapshot sets according to the retention policy
    Cleanup(CleanupCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };

    let code = match cli.command {
        Commands::Sync(cmd) => cmd.execute(config, format).await,
        Commands::Rollback(cmd) => cmd.execute(config, format).await,
        Commands::Cleanup(cmd) => cmd.execute(config, format).await,
    };
    std::process::exit(code);
}
