//! HTTP API for the broadcaster
//!
//! The display layer drives the session through these endpoints:
//! - `POST /api/session` - Start broadcasting
//! - `GET /api/session` - Current session status
//! - `DELETE /api/session` - Stop broadcasting
//! - `GET /health` - Liveness
//! - `GET /metrics` - Pipeline counters

pub mod session;

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, ServerConfig};
use crate::metrics::{global_metrics, MetricsSnapshot};
use crate::session::Session;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// The broadcaster's session
    pub session: Session,
    /// Service configuration
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(session: Session, config: Arc<Config>) -> Self {
        Self { session, config }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server);

    Router::new()
        .route("/api/session", post(session::start_session))
        .route("/api/session", get(session::get_session))
        .route("/api/session", delete(session::stop_session))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Cross-origin access for the configured display origins only
fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            if origin == "*" {
                tracing::warn!("Ignoring wildcard in allowed_origins");
                return None;
            }
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid allowed origin");
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Metrics endpoint
async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(global_metrics().snapshot())
}
