//! Node API Handlers
//!
//! HTTP endpoints for node registration, liveness and inventory.

use axum::{
    Json,
    extract::{Path, State},
};

use keel_core::dto::Ack;
use keel_core::dto::node::{
    HeartbeatRequest, MetricsReport, NodeSummary, RegisterNode, RegisterResponse, ResourceInfo,
};

use crate::api::error::ApiResult;
use crate::service::node_service;
use crate::state::AppState;

// =============================================================================
// Registration & Liveness
// =============================================================================

/// POST /api/nodes/register
pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNode>,
) -> ApiResult<Json<RegisterResponse>> {
    tracing::info!("Registering node: {}", req.node_id);

    Ok(Json(node_service::register(&state, req).await?))
}

/// POST /api/nodes/{id}/heartbeat
pub async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<Ack>> {
    tracing::debug!("Heartbeat from node: {}", id);

    Ok(Json(node_service::heartbeat(&state, &id, req.metrics).await?))
}

/// POST /api/nodes/{id}/metrics
pub async fn report_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MetricsReport>,
) -> ApiResult<Json<Ack>> {
    Ok(Json(
        node_service::report_metrics(&state, &id, req.metrics).await?,
    ))
}

/// POST /api/nodes/{id}/resources
pub async fn update_resources(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResourceInfo>,
) -> ApiResult<Json<Ack>> {
    tracing::debug!("Resource info from node: {}", id);

    Ok(Json(
        node_service::update_resource_info(&state, &id, req).await?,
    ))
}

// =============================================================================
// Node Query Endpoints
// =============================================================================

/// GET /api/nodes
pub async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<NodeSummary>>> {
    Ok(Json(node_service::list_nodes(&state).await?))
}

/// GET /api/nodes/{id}
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NodeSummary>> {
    Ok(Json(node_service::get_node(&state, &id).await?))
}
