use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use market_gate::config::{GateConfig, LogFormat};
use market_gate::http::{self, AppState, HttpServer};
use market_gate::ratelimit::{LimiterRegistry, SystemClock};

/// Marketplace API admission-control server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "MARKET_GATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the configuration file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log filter directive, e.g. "info" or "market_gate=debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GateConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Market Gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let registry = Arc::new(LimiterRegistry::start(
        &config.rate_limiting,
        Arc::new(SystemClock),
    )?);

    let state = AppState::new(Arc::clone(&registry));
    let router = http::router(state, &config.rate_limiting.health_path, Router::new())?;

    HttpServer::new(config.server.listen_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    info!("Market Gate stopped");
    Ok(())
}

fn init_tracing(config: &GateConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
