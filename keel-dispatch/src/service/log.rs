//! Log Service
//!
//! Read access to execution logs.

use futures::Stream;

use keel_core::domain::log::LogEntry;
use keel_core::dto::log::LogQuery;

use crate::service::pipeline::{self as pipeline_service, PipelineError};
use crate::state::AppState;

/// Stream the logs of a known execution
///
/// A follow stream of an execution that already finished ends after history.
pub async fn stream_logs(
    state: &AppState,
    execution_id: &str,
    query: LogQuery,
) -> Result<impl Stream<Item = LogEntry> + Send + 'static, PipelineError> {
    let pipeline = pipeline_service::get_execution(state, execution_id).await?;
    let follow = query.follow && !pipeline.state().is_terminal();

    tracing::debug!(
        "Streaming logs of {} (since: {:?}, follow: {})",
        execution_id,
        query.since,
        follow
    );
    Ok(state.logs.stream_since(execution_id, query.since, follow))
}
