//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::repository::RepositoryError;
use crate::service::{node_service, pipeline_service};

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => ApiError::NotFound(format!("{} not found", id)),
            RepositoryError::Conflict(id) => ApiError::Conflict(format!("{} already exists", id)),
            RepositoryError::Backend(msg) => ApiError::InternalError(msg),
        }
    }
}

impl From<node_service::NodeError> for ApiError {
    fn from(err: node_service::NodeError) -> Self {
        match err {
            node_service::NodeError::NotFound(id) => {
                ApiError::NotFound(format!("Node {} not found", id))
            }
            node_service::NodeError::RepositoryError(err) => err.into(),
        }
    }
}

impl From<pipeline_service::PipelineError> for ApiError {
    fn from(err: pipeline_service::PipelineError) -> Self {
        match err {
            pipeline_service::PipelineError::NotFound(id) => {
                ApiError::NotFound(format!("Execution {} not found", id))
            }
            pipeline_service::PipelineError::StepNotFound {
                execution_id,
                step_id,
            } => ApiError::NotFound(format!(
                "Step {} of execution {} not found",
                step_id, execution_id
            )),
            pipeline_service::PipelineError::ValidationError(msg) => ApiError::BadRequest(msg),
            pipeline_service::PipelineError::RepositoryError(err) => err.into(),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
