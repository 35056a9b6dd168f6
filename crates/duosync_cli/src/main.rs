//! duosync CLI
//!
//! Keeps two folders synchronized.
//!
//! # Commands
//!
//! - `run` - Synchronize two folders in a polling loop until interrupted
//! - `once` - Run a single detect and sync pass
//! - `status` - Display replica metadata
//! - `gc` - Purge old tombstones every peer has seen

mod commands;

use clap::{Args, Parser, Subcommand};
use duosync_engine::{ConflictPolicy, SyncDirection};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Two-way folder synchronization.
#[derive(Parser)]
#[command(name = "duosync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that synchronize a pair.
#[derive(Args, Debug, Clone)]
pub struct PairArgs {
    /// Local folder
    pub left: PathBuf,

    /// Remote folder
    pub right: PathBuf,

    /// Which way changes flow (upload, download, both)
    #[arg(short, long, default_value = "both")]
    pub direction: SyncDirection,

    /// Conflict policy (newest, local, remote, manual)
    #[arg(short, long, default_value = "newest")]
    pub policy: ConflictPolicy,

    /// File name patterns to leave out of synchronization
    #[arg(short, long = "exclude", default_value = "*.lnk")]
    pub excludes: Vec<String>,

    /// Delete and overwrite without keeping copies in the recycle bin
    #[arg(long)]
    pub no_recycle: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize two folders until interrupted
    Run {
        #[command(flatten)]
        pair: PairArgs,

        /// Pause between passes in milliseconds
        #[arg(short, long, default_value = "25")]
        interval_ms: u64,
    },

    /// Run a single synchronization pass
    Once {
        #[command(flatten)]
        pair: PairArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display replica metadata
    Status {
        /// Replica folder
        path: PathBuf,

        /// List every item record
        #[arg(short, long)]
        items: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Purge tombstones older than the retention period
    Gc {
        /// Replica folder
        path: PathBuf,

        /// Keep tombstones younger than this many days
        #[arg(short, long, default_value = "30")]
        retention_days: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { pair, interval_ms } => {
            commands::run::run(&pair, interval_ms)?;
        }
        Commands::Once { pair, format } => {
            commands::once::run(&pair, &format)?;
        }
        Commands::Status {
            path,
            items,
            format,
        } => {
            commands::status::run(&path, items, &format)?;
        }
        Commands::Gc {
            path,
            retention_days,
        } => {
            commands::gc::run(&path, retention_days)?;
        }
        Commands::Version => {
            println!("duosync v{}", env!("CARGO_PKG_VERSION"));
            println!("journal format v{}", duosync_storage::JOURNAL_FORMAT);
        }
    }

    Ok(())
}
