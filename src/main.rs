use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use trip_coordinator::routing::{RouteProvider, StraightLineRouter};
use trip_coordinator::{api, config, error, state};

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let router: Arc<dyn RouteProvider> = Arc::new(StraightLineRouter::new(config.route_speed_kmh));
    let shared_state = Arc::new(state::AppState::new(router, config.session()));

    let app = api::rest::router(shared_state.clone()).layer(CorsLayer::permissive());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        publish_throttle_ms = config.publish_throttle_ms,
        deviation_threshold_m = config.deviation_threshold_m,
        "http server started"
    );

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
