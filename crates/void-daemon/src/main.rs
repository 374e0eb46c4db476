//! voidd - the Void domain-blocking daemon.
//!
//! Loads configuration, refuses to run without root (PF anchors and pfctl
//! need it), starts the rule engine, and serves the JSON API on a Unix
//! socket until SIGINT/SIGTERM. The worker finishes its in-flight command
//! and PF sync before the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::Uid;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use void_core::config::Config;
use void_core::pf::{PfManager, PfctlRunner};
use void_core::resolver::DnsResolver;
use void_daemon::engine::Engine;
use void_daemon::{server, socket};

/// voidd - Void domain-blocking daemon
#[derive(Parser, Debug)]
#[command(name = "voidd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file (default: ~/.void/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    if !Uid::effective().is_root() {
        anyhow::bail!("voidd must run as root");
    }

    let resolver = Arc::new(DnsResolver::new(config.rules.dns_timeout));
    let pf = PfManager::new(Arc::new(PfctlRunner));

    let mut engine = Engine::new(pf, resolver, config.rules.dns_refresh_interval);
    let handle = engine.handle();
    engine.run();

    let listener = socket::bind(&config.socket.path).context("failed to bind control socket")?;
    info!(
        pid = std::process::id(),
        socket = %config.socket.path.display(),
        "voidd started"
    );

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_shutdown.cancel();
    });

    server::serve(listener, handle, shutdown)
        .await
        .context("api server error")?;

    info!("shutting down");
    engine.close().await;

    if let Err(err) = std::fs::remove_file(&config.socket.path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "failed to remove socket file");
        }
    }

    info!("voidd shutdown complete");
    Ok(())
}
