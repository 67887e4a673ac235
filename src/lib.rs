// Public API for integration tests and potential library usage

pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod repository;
pub mod scoring;
pub mod state;
pub mod transport;
pub mod types;
pub mod ws;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// The HTTP and WebSocket routes of the server
pub fn app(state: Arc<state::AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/health", get(api::health))
        .route("/api/sessions/{code}", get(api::get_session))
        .route("/api/sessions/{code}/leaderboard", get(api::get_leaderboard))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
