//! itemdb CLI
//!
//! Command-line tools for itemdb store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics and stored type metadata
//! - `check` - Verify metadata consistency between tables
//! - `version` - Show version information
//!
//! These commands read the store's metadata tables directly and need no
//! registered schema, so they work against any itemdb store.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// itemdb command-line store tools.
#[derive(Parser)]
#[command(name = "itemdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Display store statistics and stored type metadata
    Inspect {
        /// Show per-attribute details for every stored type
        #[arg(short, long)]
        attributes: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify metadata consistency between tables
    Check,

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
        Commands::Inspect { attributes, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, attributes, &format)?;
        }
        Commands::Check => {
            let path = cli.path.ok_or("Store path required for check")?;
            commands::check::run(&path)?;
        }
        Commands::Version => {
            println!("itemdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("itemdb Core v{}", itemdb_core::VERSION);
        }
    }

    Ok(())
}
