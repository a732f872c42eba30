//! Main entry point for the visit tracker CLI.

use anyhow::{Context, Result};
use clap::Parser;
use visit_tracker::{cli, replay, settings::Settings, signature, store, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load()?;

    // Initialize logging
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Replay { hits, output } => replay::run(hits, output, settings).await,
        cli::Commands::Inspect { visitor, hashed } => {
            let key = if hashed {
                visitor
            } else {
                signature::visitor_key(&visitor)
            };
            let store = store::open(&settings.store).context("Failed to open visit store")?;
            match store.load_last_visit(&key).await? {
                Some(row) => println!("{}", serde_json::to_string_pretty(&row)?),
                None => println!("No visit stored for visitor key {}", key),
            }
            Ok(())
        }
    }
}
