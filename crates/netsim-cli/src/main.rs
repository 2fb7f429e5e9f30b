//! Network namespace emulator CLI
//!
//! Command-line access to the control server: bring up the emulator process
//! itself, or query a running one's topology snapshot.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_serve, cmd_snapshot};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control server, binding the HTTP/WebSocket listener
    Serve {
        /// Address to bind (host:port)
        #[arg(long, default_value = "127.0.0.1:7890")]
        bind: String,
    },

    /// Fetch a topology snapshot from a running control server
    Snapshot {
        /// Base URL of the control server
        #[arg(long, default_value = "http://127.0.0.1:7890")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            cmd_serve(&bind).await?;
        }
        Commands::Snapshot { server } => {
            cmd_snapshot(&server).await?;
        }
    }

    Ok(())
}
