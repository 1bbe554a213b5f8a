//! API Module
//!
//! HTTP API layer for the dispatch server.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod node;
pub mod pipeline;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Node endpoints
        .route("/api/nodes", get(node::list_nodes))
        .route("/api/nodes/register", post(node::register_node))
        .route("/api/nodes/{id}", get(node::get_node))
        .route("/api/nodes/{id}/heartbeat", post(node::node_heartbeat))
        .route("/api/nodes/{id}/metrics", post(node::report_metrics))
        .route("/api/nodes/{id}/resources", post(node::update_resources))
        // Execution endpoints
        .route("/api/executions", post(pipeline::execute_pipeline))
        .route("/api/executions/{id}", get(pipeline::get_execution))
        .route(
            "/api/executions/{id}/status",
            post(pipeline::update_pipeline_status),
        )
        .route(
            "/api/executions/{id}/steps/{step_id}/status",
            post(pipeline::update_step_status),
        )
        .route("/api/executions/{id}/cancel", post(pipeline::cancel_pipeline))
        .route("/api/executions/{id}/logs", get(pipeline::stream_logs))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
