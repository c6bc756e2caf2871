//! GateMQ Server - broker with an admin HTTP API
//!
//! This is the main entry point for the GateMQ message broker.

mod api;
mod config;

use std::path::PathBuf;

use clap::Parser;
use gatemq_core::Broker;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{create_router, AppState};
use crate::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "gatemq", version, about = "GateMQ message broker")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "GATEMQ_CONFIG")]
    config: Option<PathBuf>,

    /// Admin API address; overrides the file and GATEMQ_BIND_ADDR
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatemq=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }

    let broker = Broker::new(config.broker.clone())?;
    broker.start();
    let publisher = broker.connect(config.server.publisher.clone())?;

    let app = create_router(AppState::new(broker.clone(), publisher));

    let addr = config.server.bind_addr.as_str();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("GateMQ server listening on {}", addr);
    info!("Swagger UI: http://{}/swagger-ui/", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
