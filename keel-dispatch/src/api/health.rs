//! Health Check API Handler

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::state::AppState;

/// GET /health
/// Health check endpoint, with the number of connected nodes
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "connected_nodes": state.dispatch.session_count(),
        })),
    )
}
