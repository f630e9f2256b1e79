//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Execute-once command cache
#[derive(Parser)]
#[command(name = "cmdcache")]
#[command(about = "Runs each (id, command) pair once and serves the cached result")]
#[command(version)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to, overrides server.host and server.port
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// Store file, overrides store.path
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Resolve every command listed in a batch file
    Run {
        /// Path to the batch file (TOML)
        #[arg(short, long)]
        file: PathBuf,

        /// Store file, overrides store.path
        #[arg(long)]
        store: Option<PathBuf>,
    },
}
