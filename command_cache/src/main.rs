//! Main entry point for the command cache CLI.

use anyhow::Result;
use clap::Parser;
use command_cache::{batch, cli, server, settings::Settings, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let mut settings = Settings::load(args.config.as_deref())?;

    match &args.command {
        cli::Commands::Serve { addr, store } => {
            if let Some(addr) = addr {
                settings.server.host = addr.ip().to_string();
                settings.server.port = addr.port();
            }
            if let Some(store) = store {
                settings.store.path = store.clone();
            }
        }
        cli::Commands::Run { store, .. } => {
            if let Some(store) = store {
                settings.store.path = store.clone();
            }
        }
    }
    settings.validate()?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    match args.command {
        cli::Commands::Serve { .. } => server::serve(&settings).await,
        cli::Commands::Run { file, .. } => batch::run(file, settings).await,
    }
}
