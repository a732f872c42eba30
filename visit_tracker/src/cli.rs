//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Visit-state resolver for tracking hits
#[derive(Parser)]
#[command(name = "visit-tracker")]
#[command(about = "Resolve tracking hits into visits and persist the changes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a JSON-lines file of tracking hits into the visit store
    Replay {
        /// Path to the hits file
        #[arg(short = 'i', long)]
        hits: PathBuf,

        /// Write the replay report as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the last stored visit of a visitor
    Inspect {
        /// Raw visitor id, as sent by the client
        #[arg(long)]
        visitor: String,

        /// Treat `--visitor` as an already hashed visitor key
        #[arg(long)]
        hashed: bool,
    },
}
