//! Change Feed CLI
//!
//! Runs change feed consumption jobs against the reference document store
//! and manages their persisted cursors.
//!
//! # Commands
//!
//! - `run` - Seed the store with sample families and consume its change feed
//! - `cursors` - List the persisted cursors of a job
//! - `reset` - Restart a range of a job from the beginning
//! - `version` - Show version information

mod commands;
mod family;

use changefeed_protocol::{DeliveryMode, DowngradePolicy, METADATA_WIRE_FORMAT};
use clap::{Parser, Subcommand};
use commands::run::RunOptions;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Change feed consumption tools.
#[derive(Parser)]
#[command(name = "changefeed")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the reference store and consume its change feed
    ///
    /// The store is re-seeded on every run, but cursors in --cursor-dir are
    /// kept. A range whose saved cursor is ahead of the new store halts with a
    /// bad request; clear it with `changefeed reset` and run again.
    Run {
        /// Job name
        #[arg(short, long, default_value = "default")]
        job: String,

        /// Number of partition ranges in the store
        #[arg(long, default_value = "1")]
        partitions: u32,

        /// Ranges to consume, comma separated (default: all)
        #[arg(short, long, value_delimiter = ',')]
        ranges: Vec<String>,

        /// Delivery mode (enriched, plain)
        #[arg(short, long)]
        mode: Option<DeliveryMode>,

        /// Directory for durable cursors
        #[arg(short, long)]
        cursor_dir: Option<PathBuf>,

        /// JSON feed configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop each range after this many consecutive empty polls
        #[arg(short, long)]
        idle_polls: Option<u32>,

        /// Reaction to a store without metadata support (fail, degrade)
        #[arg(short, long)]
        downgrade: Option<DowngradePolicy>,

        /// Maximum number of changes per poll
        #[arg(short, long)]
        page_size: Option<u32>,
    },

    /// List the persisted cursors of a job
    Cursors {
        /// Directory for durable cursors
        #[arg(short, long)]
        cursor_dir: PathBuf,

        /// Job name
        #[arg(short, long, default_value = "default")]
        job: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Restart a range of a job from the beginning
    Reset {
        /// Directory for durable cursors
        #[arg(short, long)]
        cursor_dir: PathBuf,

        /// Job name
        #[arg(short, long, default_value = "default")]
        job: String,

        /// Range to reset
        #[arg(short, long)]
        range: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            job,
            partitions,
            ranges,
            mode,
            cursor_dir,
            config,
            idle_polls,
            downgrade,
            page_size,
        } => {
            commands::run::run(&RunOptions {
                job,
                partitions,
                ranges,
                cursor_dir,
                config,
                mode,
                idle_polls,
                downgrade,
                page_size,
            })?;
        }
        Commands::Cursors {
            cursor_dir,
            job,
            format,
        } => {
            commands::cursors::run(&cursor_dir, &job, &format)?;
        }
        Commands::Reset {
            cursor_dir,
            job,
            range,
        } => {
            commands::reset::run(&cursor_dir, &job, &range)?;
        }
        Commands::Version => {
            println!("changefeed CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Wire format v{}", METADATA_WIRE_FORMAT);
        }
    }

    Ok(())
}
