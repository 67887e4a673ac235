//! HTTP API endpoints.
//!
//! Read-only views for lobby screens and monitoring. All game actions go
//! through the WebSocket.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::protocol::SessionInfo;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub live_sessions: usize,
    pub running_engines: usize,
    pub catalog: String,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        live_sessions: state.registry.len().await,
        running_engines: state.engine_count().await,
        catalog: state.catalog.name().to_string(),
    })
}

fn lookup_failed(e: crate::repository::RepositoryError) -> Response {
    tracing::error!("Session lookup failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

/// Public lobby view of a session.
///
/// GET /api/sessions/{code}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.repo.find_session_by_code(&code).await {
        Ok(Some(session)) => Json(SessionInfo::from(&session)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => lookup_failed(e),
    }
}

/// GET /api/sessions/{code}/leaderboard
pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Response {
    match state.repo.find_session_by_code(&code).await {
        Ok(Some(session)) => Json(session.leaderboard).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => lookup_failed(e),
    }
}
