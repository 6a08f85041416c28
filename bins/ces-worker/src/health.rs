// Liveness route for the worker

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::ContainerEngine;

pub fn routes(engine: Arc<dyn ContainerEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(engine)
}

/// GET /health - healthy while the container daemon answers
pub async fn health_check(
    State(engine): State<Arc<dyn ContainerEngine>>,
) -> (StatusCode, &'static str) {
    match engine.ping().await {
        Ok(response) if response.is_success() => (StatusCode::OK, "OK"),
        Ok(response) => {
            warn!(status = response.status, "Engine ping refused");
            (StatusCode::SERVICE_UNAVAILABLE, "ENGINE UNAVAILABLE")
        }
        Err(e) => {
            warn!(error = %e, "Engine ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "ENGINE UNAVAILABLE")
        }
    }
}

pub async fn serve(
    port: u16,
    engine: Arc<dyn ContainerEngine>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Health endpoint listening on {}", addr);

    axum::serve(listener, routes(engine))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
