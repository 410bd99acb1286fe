//! HTTP router for the publish-session API.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::state::AppState;

/// Create the API router with all endpoints.
///
/// # Routes
///
/// ## Health & Readiness
/// - `GET /health`
/// - `GET /ready`
///
/// ## Publish sessions
/// - `POST /api/v1/publish`: initiate (primary user session)
/// - `POST /api/v1/publish/attest`: worker attestation (identity token)
/// - `POST /api/v1/publish/{id}/events`: progress (capability token)
/// - `POST /api/v1/publish/{id}/finalize`: outcome (capability token)
/// - `GET /api/v1/publish/{id}`: status polling (no auth)
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_v1 = Router::new()
        .route("/publish", post(handlers::initiate_handler))
        .route("/publish/attest", post(handlers::attest_handler))
        .route("/publish/{id}", get(handlers::read_status_handler))
        .route("/publish/{id}/events", post(handlers::update_handler))
        .route("/publish/{id}/finalize", post(handlers::finalize_handler))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/ready", get(handlers::ready_handler).with_state(state))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (e.g. "127.0.0.1:8787")
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    config: ServerConfig,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    tracing::info!("starting publish-session API on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
