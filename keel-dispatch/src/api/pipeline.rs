//! Execution API Handlers
//!
//! HTTP endpoints for submitting, mirroring and cancelling executions, and
//! for streaming their logs.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;

use keel_core::domain::pipeline::Pipeline;
use keel_core::dto::Ack;
use keel_core::dto::log::LogQuery;
use keel_core::dto::pipeline::{
    CancelPipeline, ExecutePipeline, ExecutePipelineResponse, UpdatePipelineStatus,
    UpdateStepStatus,
};

use crate::api::error::ApiResult;
use crate::service::{log_service, pipeline_service};
use crate::state::AppState;

// =============================================================================
// Submission & Cancellation
// =============================================================================

/// POST /api/executions
/// Create an execution and assign it to the requested node
pub async fn execute_pipeline(
    State(state): State<AppState>,
    Json(req): Json<ExecutePipeline>,
) -> ApiResult<Json<ExecutePipelineResponse>> {
    tracing::info!(
        "Executing pipeline '{}' on node {}",
        req.pipeline.name,
        req.node_id
    );

    Ok(Json(pipeline_service::execute(&state, req).await?))
}

/// POST /api/executions/{id}/cancel
pub async fn cancel_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CancelPipeline>,
) -> ApiResult<Json<Ack>> {
    tracing::info!("Cancelling execution {}: {}", id, req.reason);

    Ok(Json(pipeline_service::cancel(&state, &id, req.reason).await?))
}

// =============================================================================
// Status Mirror
// =============================================================================

/// GET /api/executions/{id}
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Pipeline>> {
    tracing::debug!("Getting execution: {}", id);

    Ok(Json(pipeline_service::get_execution(&state, &id).await?))
}

/// POST /api/executions/{id}/status
pub async fn update_pipeline_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePipelineStatus>,
) -> ApiResult<Json<Ack>> {
    Ok(Json(
        pipeline_service::update_status(&state, &id, req.status).await?,
    ))
}

/// POST /api/executions/{id}/steps/{step_id}/status
pub async fn update_step_status(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(req): Json<UpdateStepStatus>,
) -> ApiResult<Json<Ack>> {
    tracing::debug!("Step {} of {} is {}", step_id, id, req.status.state);

    Ok(Json(
        pipeline_service::update_step_status(&state, &id, &step_id, req).await?,
    ))
}

// =============================================================================
// Logs
// =============================================================================

/// GET /api/executions/{id}/logs?since=<rfc3339>&follow=<bool>
/// Newline-delimited JSON stream of log entries
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Response> {
    let entries = log_service::stream_logs(&state, &id, query).await?;

    let body = entries.map(|entry| {
        serde_json::to_vec(&entry).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}
