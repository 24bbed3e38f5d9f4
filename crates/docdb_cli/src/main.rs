//! docdb CLI
//!
//! Command-line tools for docdb engine directories.
//!
//! # Commands
//!
//! - `inspect` - List logfiles with status and tick ranges
//! - `dump` - List the markers of one logfile
//! - `verify` - Check every logfile and datafile for corruption
//! - `recover` - Run crash recovery and shut down cleanly

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docdb command-line tools.
#[derive(Parser)]
#[command(name = "docdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the engine directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List logfiles with status and tick ranges
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the markers of one logfile
    Dump {
        /// Logfile id
        #[arg(short, long)]
        logfile: u64,

        /// Maximum number of markers to list
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every logfile and datafile for corruption
    Verify,

    /// Run crash recovery and shut down cleanly
    Recover {
        /// Stop reading a logfile at a damaged marker instead of failing
        #[arg(short, long)]
        ignore_errors: bool,

        /// Number of replay errors tolerated before recovery fails
        #[arg(short, long, default_value = "0")]
        max_errors: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Engine path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Dump {
            logfile,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Engine path required for dump")?;
            commands::dump::run(&path, logfile, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Engine path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Recover {
            ignore_errors,
            max_errors,
        } => {
            let path = cli.path.ok_or("Engine path required for recover")?;
            commands::recover::run(&path, ignore_errors, max_errors)?;
        }
        Commands::Version => {
            println!("docdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("WAL format v{}", docdb_core::wal::WAL_VERSION);
        }
    }

    Ok(())
}
