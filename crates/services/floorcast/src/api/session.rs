//! Session endpoints
//!
//! Start and stop return immediately; the work runs in the background and
//! its progress is visible through `GET /api/session`.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::session::{SessionError, SessionInfo};

/// Request body for starting a session
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Label of the stream resource
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    "floorcast".to_string()
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Start broadcasting
///
/// POST /api/session
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    match state.session.spawn_start(req.name) {
        Ok(info) => (StatusCode::ACCEPTED, Json(info)).into_response(),
        Err(SessionError::AlreadyActive) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: "session_active".to_string(),
                message: "a session is already starting or publishing".to_string(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Session could not be claimed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal".to_string(),
                    message: "session could not be started".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Current session status
///
/// GET /api/session
pub async fn get_session(State(state): State<AppState>) -> Json<SessionInfo> {
    Json(state.session.info())
}

/// Stop broadcasting
///
/// DELETE /api/session
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.clone();
    tokio::spawn(async move {
        if let Err(e) = session.stop().await {
            tracing::warn!(error = %e, "Session stop was incomplete");
        }
    });

    StatusCode::ACCEPTED
}
