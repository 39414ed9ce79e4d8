#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use dsync_server::config::{Args, ServerConfig};
use dsync_server::metrics::start_metrics_server;
use dsync_server::server::ServerState;
use dsync_server::run_with_shutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(val) if !val.is_empty() => EnvFilter::new(val),
        _ => {
            let level = match verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!("dsync_server={level},dsync_proto={level}"))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let state = Arc::new(ServerState::new(config));
    if let Some(metrics_addr) = state.config.metrics_addr {
        tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                if let Err(e) = start_metrics_server(metrics_addr, state).await {
                    warn!("metrics server error: {}", e);
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}
