use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    api::handler::{
        get_job, github_webhook, health_check, list_jobs, register_wallet, requeue_job,
        wallet_challenge, AppState,
    },
    config::Config,
    middleware::create_cors_layer,
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        // GitHub App deliveries
        .route("/webhook", post(github_webhook))
        .nest(
            "/api/v1",
            Router::new()
                // Read model
                .route("/jobs", get(list_jobs))
                .route("/jobs/:id", get(get_job))
                // Contributor wallets
                .route("/contributors/wallet/challenge", post(wallet_challenge))
                .route("/contributors/wallet", post(register_wallet))
                // Operator endpoints, bearer token required
                .route("/admin/jobs/:id/requeue", post(requeue_job))
                .layer(create_cors_layer(&config.cors_origins())),
        )
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
