//! envflowd: envflow control plane daemon

mod config;
mod server;

use anyhow::Context;
use clap::Parser;
use envflow_cloud::RetryConfig;
use envflow_controlplane::ControlPlane;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "envflowd")]
#[command(about = "envflow control plane daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./envflow.kdl, then <config_dir>/envflow/envflow.kdl)
    #[arg(short, long, env = "ENVFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long, env = "ENVFLOW_LISTEN")]
    listen: Option<SocketAddr>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "ENVFLOW_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_env_filter(filter)
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        return;
    }
    tracing::info!("Shutting down, cancelling running operations");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let (mut config, source) = config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    match &source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => tracing::info!("No configuration file found, using defaults"),
    }

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.state_dir.display()
        )
    })?;

    let plane = ControlPlane::aws(config.settings(), config.terraform(), &RetryConfig::default())
        .await
        .context("failed to start the control plane")?;

    let shutdown = CancellationToken::new();
    let app = server::router(server::AppState::new(plane, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(listen = %config.listen, "envflowd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("envflowd stopped");
    Ok(())
}
