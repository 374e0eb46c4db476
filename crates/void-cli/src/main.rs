//! void - CLI for the Void domain-blocking daemon.
//!
//! Talks to `voidd` over its Unix-socket JSON API. Blocking without a
//! duration is permanent and asks for confirmation first.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use void_core::config::Config;

mod client;
mod commands;

use client::Client;

/// void - block distracting domains at the packet filter
#[derive(Parser, Debug)]
#[command(name = "void")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the daemon's Unix socket (default: from ~/.void/config.yaml)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Block a domain (permanent unless a duration is given)
    Block {
        /// Domain to block, e.g. facebook.com
        domain: String,

        /// How long to block, e.g. "30s", "5m", "2h30m"
        duration: Option<String>,
    },

    /// Remove a blocking rule by id
    Unblock {
        /// Rule id as shown by `void list`
        id: String,
    },

    /// List currently active rules
    #[command(alias = "ls")]
    List,

    /// Show daemon status
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let socket_path = match cli.socket {
        Some(path) => path,
        None => {
            Config::load()
                .context("failed to load configuration")?
                .socket
                .path
        }
    };
    let client = Client::new(socket_path);

    match cli.command {
        Commands::Block { domain, duration } => {
            commands::block(&client, &domain, duration.as_deref()).await
        }
        Commands::Unblock { id } => commands::unblock(&client, &id).await,
        Commands::List => commands::list(&client).await,
        Commands::Status => commands::status(&client).await,
        Commands::Version => {
            commands::version();
            Ok(())
        }
    }
}
