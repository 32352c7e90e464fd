//! Datasync CLI
//!
//! Operator tools for the shared datasync database.
//!
//! # Commands
//!
//! - `queues` - Display per-queue counts by state
//! - `prune` - Delete finished items of one queue
//! - `lock` - Show the holder of a distributed lock
//! - `release-lock` - Force-clear a lock left by a crashed holder
//! - `config` - Print the effective server configuration

mod commands;

use clap::{Parser, Subcommand};
use datasync_server::{DEFAULT_LOCK_NAME, SYNC_QUEUE};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Datasync operator tools.
#[derive(Parser)]
#[command(name = "datasync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the shared SQLite database
    #[arg(global = true, short, long)]
    db: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display per-queue counts by state
    Queues {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete done and failed items older than the retention window
    Prune {
        /// Queue to prune
        #[arg(short, long, default_value = SYNC_QUEUE)]
        queue: String,

        /// Retention window in seconds
        #[arg(short, long, default_value = "3600")]
        retention_secs: u64,
    },

    /// Show the holder of a lock
    Lock {
        /// Lock name
        #[arg(default_value = DEFAULT_LOCK_NAME)]
        name: String,
    },

    /// Force-clear a lock regardless of its holder
    ReleaseLock {
        /// Lock name
        #[arg(default_value = DEFAULT_LOCK_NAME)]
        name: String,
    },

    /// Print the effective server configuration
    Config {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Queues { format } => {
            let db = cli.db.ok_or("Database path required for queues")?;
            commands::queues::run(&db, &format)?;
        }
        Commands::Prune {
            queue,
            retention_secs,
        } => {
            let db = cli.db.ok_or("Database path required for prune")?;
            commands::prune::run(&db, &queue, Duration::from_secs(retention_secs))?;
        }
        Commands::Lock { name } => {
            let db = cli.db.ok_or("Database path required for lock")?;
            commands::lock::show(&db, &name)?;
        }
        Commands::ReleaseLock { name } => {
            let db = cli.db.ok_or("Database path required for release-lock")?;
            commands::lock::release(&db, &name)?;
        }
        Commands::Config { config } => {
            commands::config::run(config.as_deref())?;
        }
        Commands::Version => {
            println!("datasync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
