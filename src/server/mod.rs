//! HTTP surface of the service
//!
//! Three routes: `POST /api/matting`, `POST /api/ai-fuse` and `GET /health`.

pub mod error;
pub mod handlers;

use crate::error::{FuseError, Result};
use crate::pipeline::FusionService;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FusionService>,
}

/// Build the router with CORS, request tracing and the upload size limit
pub fn router(service: FusionService) -> Router {
    let max_body = service.config().server.max_upload_bytes;
    let state = AppState {
        service: Arc::new(service),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/matting", post(handlers::matting))
        .route("/api/ai-fuse", post(handlers::ai_fuse))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C
///
/// # Errors
/// - Bind failures
pub async fn serve(service: FusionService) -> Result<()> {
    let bind = service.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| FuseError::config(format!("Failed to bind {}: {}", bind, e)))?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        addr = %local_addr,
        generator = service.generator_name(),
        "bgfuse listening"
    );

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
