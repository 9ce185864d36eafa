//! zonesync CLI
//!
//! Command-line tools for the sync metadata journal.
//!
//! # Commands
//!
//! - `inspect` - Display queue counts, cursor state and journal size
//! - `dump-queue` - List queue entries for debugging
//! - `reset-cursor` - Make the next session read the change feed from the start
//! - `clear-queue` - Drop every queue entry and the cursor
//! - `compact` - Rewrite the journal as a single snapshot

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use zonesync_engine::{default_meta_path, EntryStatus};

/// zonesync metadata tools.
#[derive(Parser)]
#[command(name = "zonesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync metadata journal (defaults to the well-known location)
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format shared by the read-only commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Queue entry status filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    /// Entries in agreement with the zone
    Clean,
    /// Entries waiting to be saved
    Dirty,
    /// Entries waiting to be deleted
    Tombstoned,
}

impl From<StatusFilter> for EntryStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Clean => EntryStatus::Clean,
            StatusFilter::Dirty => EntryStatus::Dirty,
            StatusFilter::Tombstoned => EntryStatus::Tombstoned,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue counts, cursor state and journal size
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List queue entries
    DumpQueue {
        /// Only show entries with this status
        #[arg(short, long, value_enum)]
        status: Option<StatusFilter>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Forget the change cursor so the next session refetches everything
    ResetCursor,

    /// Drop every queue entry and the change cursor
    ClearQueue,

    /// Rewrite the journal as a single snapshot frame
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = cli.path.unwrap_or_else(default_meta_path);

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&path, format)?,
        Commands::DumpQueue { status, format } => {
            commands::dump_queue::run(&path, status.map(EntryStatus::from), format)?
        }
        Commands::ResetCursor => commands::repair::reset_cursor(&path)?,
        Commands::ClearQueue => commands::repair::clear_queue(&path)?,
        Commands::Compact => commands::compact::run(&path)?,
        Commands::Version => {
            println!("zonesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
