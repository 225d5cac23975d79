//! Strand daemon - runs one replication node until interrupted
//!
//! The node provides:
//! - A reactor applying local mutations and remote loads
//! - Listener updates for every written sync unit
//! - Replication to the remotes in storage and in the config file

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use libstrand_core::config::{load_config, CONFIG_FILE_NAME};
use libstrand_core::StrandConfig;
use strand_daemon::{DaemonError, Node};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "strand-daemon", about = "Strand replication node", version)]
struct Cli {
    /// Config file (TOML); defaults apply when it does not exist
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "strand-daemon failed");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: &Cli) -> Result<(), DaemonError> {
    let config = match load_config(&cli.config)? {
        Some(config) => {
            info!(path = %cli.config.display(), "Loaded config");
            config
        }
        None => {
            info!(path = %cli.config.display(), "No config file; using defaults");
            StrandConfig::default()
        }
    };

    info!("strand-daemon starting");
    let node = Node::start(&config).await?;

    shutdown_signal().await;
    info!("Received shutdown signal");

    node.shutdown().await;
    info!("strand-daemon stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
