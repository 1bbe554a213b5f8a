//! Execution-related API endpoints

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::DispatchClient;
use crate::error::{ClientError, Result};
use keel_core::domain::log::LogEntry;
use keel_core::domain::pipeline::{Pipeline, PipelineStatus, StepStatus};
use keel_core::dto::Ack;
use keel_core::dto::log::LogQuery;
use keel_core::dto::pipeline::{
    CancelPipeline, ExecutePipeline, ExecutePipelineResponse, UpdatePipelineStatus,
    UpdateStepStatus,
};

impl DispatchClient {
    // =============================================================================
    // Submission & Cancellation
    // =============================================================================

    /// Submit a pipeline for execution on a node
    ///
    /// Capacity and unknown-node conditions come back as `accepted: false`.
    pub async fn execute_pipeline(
        &self,
        request: &ExecutePipeline,
    ) -> Result<ExecutePipelineResponse> {
        self.post_json("/api/executions", request).await
    }

    pub async fn cancel_pipeline(&self, execution_id: &str, reason: &str) -> Result<Ack> {
        self.post_json(
            &format!("/api/executions/{}/cancel", execution_id),
            &CancelPipeline {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// Mirrored pipeline and status as last reported by the executing node
    pub async fn get_execution(&self, execution_id: &str) -> Result<Pipeline> {
        self.get_json(&format!("/api/executions/{}", execution_id))
            .await
    }

    // =============================================================================
    // Status Reporting (agent -> server)
    // =============================================================================

    pub async fn update_pipeline_status(
        &self,
        execution_id: &str,
        status: &PipelineStatus,
    ) -> Result<Ack> {
        self.post_json(
            &format!("/api/executions/{}/status", execution_id),
            &UpdatePipelineStatus {
                status: status.clone(),
            },
        )
        .await
    }

    pub async fn update_step_status(
        &self,
        execution_id: &str,
        status: &StepStatus,
        logs: Vec<LogEntry>,
    ) -> Result<Ack> {
        self.post_json(
            &format!("/api/executions/{}/steps/{}/status", execution_id, status.id),
            &UpdateStepStatus {
                status: status.clone(),
                logs,
            },
        )
        .await
    }

    // =============================================================================
    // Logs
    // =============================================================================

    /// Stream log entries of an execution
    ///
    /// Entries strictly after `query.since` are replayed first; with
    /// `query.follow` the stream then stays open for new entries.
    pub async fn stream_logs(
        &self,
        execution_id: &str,
        query: &LogQuery,
    ) -> Result<impl Stream<Item = Result<LogEntry>> + Send + 'static> {
        let url = self.url(&format!("/api/executions/{}/logs", execution_id));
        let response = self.client.get(&url).query(query).send().await?;
        let response = Self::check_status(response).await?;

        let mut body = response.bytes_stream();
        let execution_id = execution_id.to_string();

        Ok(async_stream::try_stream! {
            let mut buf: Vec<u8> = Vec::new();

            while let Some(chunk) = body.next().await {
                buf.extend_from_slice(&chunk?);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if let Some(entry) = parse_entry(&line)? {
                        yield entry;
                    }
                }
            }

            if let Some(entry) = parse_entry(&buf)? {
                yield entry;
            }
            debug!(execution_id = %execution_id, "log stream ended");
        })
    }
}

/// One NDJSON line; blank lines are skipped
fn parse_entry(line: &[u8]) -> Result<Option<LogEntry>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }

    serde_json::from_slice(line)
        .map(Some)
        .map_err(|e| ClientError::ParseError(format!("Invalid log entry: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::log::LogSource;

    #[test]
    fn test_parse_entry() {
        let line = br#"{"source":"stderr","content":"boom","timestamp":"2024-05-01T10:00:00Z"}
"#;
        let entry = parse_entry(line).unwrap().unwrap();
        assert_eq!(entry.source, LogSource::Stderr);
        assert_eq!(entry.content, "boom");

        assert!(parse_entry(b"  \n").unwrap().is_none());
        assert!(parse_entry(b"{oops").is_err());
    }
}
