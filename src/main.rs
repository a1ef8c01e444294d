mod error;
mod api;
mod chain;
mod comments;
mod ledger;
mod queue;
mod settlement;
mod wallet;
mod webhooks;
mod server;
mod bootstrap;
mod middleware;
mod config;

#[cfg(test)]
mod pipeline_tests;

use futures::future::join_all;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::{error, info};

use crate::settlement::{LeaseReaper, WorkerPool};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,contrib_rewards=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for Ctrl-C: {}", e);
    }
    info!("🛑 Shutdown requested, draining workers...");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("🚀 Starting contributor rewards service");

    // Load configuration
    let config = config::Config::from_env()?;

    let services = bootstrap::initialize_services(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background tasks
    let mut tasks = Vec::new();
    match services.settlement {
        Some(deps) => {
            let reaper = LeaseReaper::new(config.reaper_config(), deps.queue.clone());
            tasks.push(reaper.start(shutdown_rx.clone()));
            tasks.extend(WorkerPool::spawn(config.worker_count, deps, shutdown_rx.clone()));
        }
        None => error!("⚠️  Settlement workers not started; jobs will queue until a treasury key is configured"),
    }

    // Create HTTP server
    let app = server::create_app(services.state, &config);

    // Run the Server
    server::run_server(app, &config.bind_address, shutdown_signal(shutdown_tx)).await?;

    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!("❌ Background task ended abnormally: {}", e);
        }
    }

    info!("✓ Shutdown complete");
    Ok(())
}
