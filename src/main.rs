mod api;
mod broadcast;
mod config;
mod engine;
mod error;
mod gateway;
mod geo;
mod index;
mod models;
mod observability;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let shared_state = Arc::new(state::AppState::new(config.clone()));

    let app = api::rest::router(shared_state.clone());

    // Recovery sweep: evicts stale driver locations and resolves any
    // offered ride whose expiry passed without its timer firing.
    let sweeper_state = shared_state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweeper_state.config.sweep_interval());
        loop {
            ticker.tick().await;
            let evicted = sweeper_state.index.expire_sweep();
            let expired = sweeper_state.dispatch.sweep_expired_offers();
            sweeper_state
                .metrics
                .drivers_tracked
                .set(sweeper_state.index.len() as i64);
            if evicted > 0 || expired > 0 {
                tracing::info!(evicted, expired, "recovery sweep");
            }
        }
    });

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| error::AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
