//! Mesh Agent - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use mesh_agent::{
    ConsumerAgent, Discovery, StaticDiscovery, TcpDialer, api, config::AgentConfig, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "mesh-agent")]
#[command(about = "Consumer-side service mesh agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override inbound listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override admin API port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Mesh Agent");

    // Load configuration
    let mut config = AgentConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(port) = cli.admin_port {
        config.admin_port = Some(port);
    }

    config.validate()?;

    tracing::info!(
        listen_port = config.listen_port,
        admin_port = ?config.admin_port,
        endpoints = config.endpoints.len(),
        load_balance = ?config.load_balance,
        pending_timeout_secs = ?config.pending_timeout_secs,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let discovery = StaticDiscovery::new(config.endpoints.clone());
    let endpoints = discovery
        .list_endpoints()
        .await
        .context("Failed to list provider endpoints")?;

    let dialer = Arc::new(TcpDialer::new(config.connect_timeout(), config.tcp_nodelay));
    let agent = ConsumerAgent::new(&config, endpoints, dialer)?;

    // Admin API runs alongside the inbound listener
    let admin_handle = match config.admin_port {
        Some(admin_port) => {
            let app = api::create_router(api::AppState {
                router: agent.router(),
                prometheus_handle,
            });

            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], admin_port));
            tracing::info!(addr = %addr, "Starting admin API server");

            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("Failed to bind admin API server")?;

            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Admin API server error");
                }
            }))
        }
        None => None,
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind inbound listener")?;

    let result = agent.serve(listener, shutdown_signal()).await;

    tracing::info!("Shutting down...");

    if let Some(handle) = admin_handle {
        handle.abort();
    }

    // A fatal condition surfaces as a non-zero exit so the supervisor restarts us
    result.context("Agent stopped after a fatal condition")?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
