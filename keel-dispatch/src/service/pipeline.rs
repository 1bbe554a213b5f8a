//! Pipeline Service
//!
//! Execution submission, status mirroring and cancellation.

use uuid::Uuid;

use keel_core::domain::pipeline::{Pipeline, PipelineStatus};
use keel_core::dto::Ack;
use keel_core::dto::pipeline::{ExecutePipeline, ExecutePipelineResponse, UpdateStepStatus};
use keel_core::dto::stream::{CancelCommand, PipelineAssignment};
use keel_core::event::FleetEvent;

use crate::dispatch::DispatchError;
use crate::repository::RepositoryError;
use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum PipelineError {
    NotFound(String),
    StepNotFound { execution_id: String, step_id: String },
    ValidationError(String),
    RepositoryError(RepositoryError),
}

impl From<RepositoryError> for PipelineError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => PipelineError::NotFound(id),
            other => PipelineError::RepositoryError(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Create an execution and hand it to the target node
///
/// The node must hold an open stream and be below its pipeline limit;
/// otherwise the execution is dropped and `accepted: false` returned.
pub async fn execute(state: &AppState, req: ExecutePipeline) -> Result<ExecutePipelineResponse> {
    if req.node_id.trim().is_empty() {
        return Err(PipelineError::ValidationError(
            "node_id cannot be empty".to_string(),
        ));
    }
    req.pipeline
        .validate()
        .map_err(PipelineError::ValidationError)?;

    let mut definition = req.pipeline;
    definition.envs.extend(req.envs);
    definition.args.extend(req.args);

    let execution_id = Uuid::new_v4().to_string();
    let mut pipeline = Pipeline::new(&execution_id, definition.clone());
    pipeline.set_node(&req.node_id);
    state.pipelines.create(pipeline).await?;

    let assignment = PipelineAssignment {
        execution_id: execution_id.clone(),
        pipeline: definition,
    };

    match state.dispatch.assign(&req.node_id, assignment).await {
        Ok(()) => {
            tracing::info!("Execution {} assigned to {}", execution_id, req.node_id);
            state
                .events
                .publish(FleetEvent::pipeline(&execution_id, "assigned"));
            Ok(ExecutePipelineResponse {
                accepted: true,
                execution_id: Some(execution_id),
                message: "assigned".to_string(),
            })
        }
        Err(e) => {
            tracing::warn!("Execution {} not assigned: {}", execution_id, e);
            state.pipelines.remove(&execution_id).await?;
            Ok(ExecutePipelineResponse {
                accepted: false,
                execution_id: None,
                message: rejection_message(&e),
            })
        }
    }
}

fn rejection_message(err: &DispatchError) -> String {
    match err {
        DispatchError::NodeUnknown(id) => format!("node {} is not connected", id),
        DispatchError::CapacityExceeded { node_id, max, .. } => {
            format!("node {} is at capacity ({} pipelines)", node_id, max)
        }
        other => other.to_string(),
    }
}

pub async fn get_execution(state: &AppState, execution_id: &str) -> Result<Pipeline> {
    state
        .pipelines
        .get(execution_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(execution_id.to_string()))
}

/// Replace the mirrored status with the agent's report
pub async fn update_status(
    state: &AppState,
    execution_id: &str,
    status: PipelineStatus,
) -> Result<Ack> {
    let new_state = status.state;
    state
        .pipelines
        .update(execution_id, Box::new(move |p| p.mirror_status(status)))
        .await?;

    tracing::debug!("Execution {} is {}", execution_id, new_state);
    state
        .events
        .publish(FleetEvent::pipeline(execution_id, new_state.to_string()));

    if new_state.is_terminal() {
        state.logs.finish(execution_id);
    }
    Ok(Ack::yes())
}

/// Replace one mirrored step status and store any attached logs
pub async fn update_step_status(
    state: &AppState,
    execution_id: &str,
    step_id: &str,
    update: UpdateStepStatus,
) -> Result<Ack> {
    if update.status.id != step_id {
        return Err(PipelineError::ValidationError(format!(
            "step id mismatch: path {} body {}",
            step_id, update.status.id
        )));
    }

    let pipeline = get_execution(state, execution_id).await?;
    if pipeline.step_index(step_id).is_none() {
        return Err(PipelineError::StepNotFound {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
        });
    }

    let status = update.status;
    let owned_step = step_id.to_string();
    state
        .pipelines
        .update(
            execution_id,
            Box::new(move |p| {
                p.mirror_step_status(&owned_step, status);
            }),
        )
        .await?;

    state.logs.append(execution_id, update.logs);
    Ok(Ack::yes())
}

/// Ask the owning node to stop an execution
///
/// `ack` is false when the owning node is not connected.
pub async fn cancel(state: &AppState, execution_id: &str, reason: String) -> Result<Ack> {
    let pipeline = get_execution(state, execution_id).await?;
    let Some(node_id) = pipeline.status().node_id.clone() else {
        return Ok(Ack::no());
    };

    let delivered = state
        .dispatch
        .cancel(
            &node_id,
            CancelCommand {
                execution_id: Some(execution_id.to_string()),
                reason,
            },
        )
        .await;

    tracing::info!(
        "Cancel of {} on {}: {}",
        execution_id,
        node_id,
        if delivered { "queued" } else { "node not connected" }
    );
    Ok(Ack { ack: delivered })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use keel_core::domain::log::{LogEntry, LogSource};
    use keel_core::domain::pipeline::{
        ContainerConfig, PipelineDefinition, PipelineState, PipelineStep, StepKind, StepState,
    };
    use std::collections::HashMap;

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "start-platform".to_string(),
            description: None,
            envs: HashMap::from([("MODE".to_string(), "dev".to_string())]),
            args: HashMap::new(),
            steps: vec![PipelineStep {
                name: "run".to_string(),
                kind: StepKind::Container,
                container: ContainerConfig {
                    image: "alpine".to_string(),
                    commands: vec!["true".to_string()],
                    ..Default::default()
                },
            }],
        }
    }

    fn request(node_id: &str) -> ExecutePipeline {
        ExecutePipeline {
            node_id: node_id.to_string(),
            pipeline: definition(),
            envs: HashMap::from([("MODE".to_string(), "prod".to_string())]),
            args: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_on_unconnected_node_is_rejected() {
        let state = AppState::in_memory(&Config::default());

        let resp = execute(&state, request("ghost")).await.unwrap();
        assert!(!resp.accepted);
        assert!(resp.execution_id.is_none());
        assert!(state.pipelines.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_at_capacity_is_rejected() {
        let state = AppState::in_memory(&Config::default());
        let session = state.dispatch.get_or_create("node-1");
        session.update_claimed(vec!["a".into(), "b".into()]);

        let resp = execute(&state, request("node-1")).await.unwrap();
        assert!(!resp.accepted);
        assert!(resp.message.contains("capacity"));
    }

    #[tokio::test]
    async fn test_execute_queues_merged_assignment() {
        let state = AppState::in_memory(&Config::default());
        let session = state.dispatch.get_or_create("node-1");

        let resp = execute(&state, request("node-1")).await.unwrap();
        assert!(resp.accepted);
        let id = resp.execution_id.unwrap();

        let mut mailbox = session.claim_mailbox().unwrap();
        let assignment = mailbox.assignments.try_recv().unwrap();
        assert_eq!(assignment.execution_id, id);
        assert_eq!(assignment.pipeline.envs["MODE"], "prod");

        let stored = get_execution(&state, &id).await.unwrap();
        assert_eq!(stored.status().node_id.as_deref(), Some("node-1"));
        assert_eq!(stored.state(), PipelineState::Pending);
    }

    #[tokio::test]
    async fn test_status_mirror_and_step_logs() {
        let state = AppState::in_memory(&Config::default());
        state.dispatch.get_or_create("node-1");
        let id = execute(&state, request("node-1"))
            .await
            .unwrap()
            .execution_id
            .unwrap();

        // agent-side copy drives the state machine
        let mut agent = Pipeline::new(&id, definition());
        agent.update_pipeline_state(PipelineState::Running).unwrap();
        agent.update_step_state(0, StepState::Running).unwrap();

        update_step_status(
            &state,
            &id,
            "run",
            UpdateStepStatus {
                status: agent.step_status(0).unwrap().clone(),
                logs: vec![LogEntry::new(LogSource::Stdout, "hello")],
            },
        )
        .await
        .unwrap();
        update_status(&state, &id, agent.status().clone()).await.unwrap();

        let mirrored = get_execution(&state, &id).await.unwrap();
        assert_eq!(mirrored.state(), PipelineState::Running);
        assert_eq!(mirrored.step_status(0).unwrap().state, StepState::Running);
        assert_eq!(state.logs.query_since(&id, None).len(), 1);

        let err = update_step_status(
            &state,
            &id,
            "missing",
            UpdateStepStatus {
                status: {
                    let mut s = agent.step_status(0).unwrap().clone();
                    s.id = "missing".into();
                    s
                },
                logs: vec![],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::StepNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_execution() {
        let state = AppState::in_memory(&Config::default());
        let err = cancel(&state, "nope", "x".into()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_routes_to_owning_node() {
        let state = AppState::in_memory(&Config::default());
        let session = state.dispatch.get_or_create("node-1");
        let id = execute(&state, request("node-1"))
            .await
            .unwrap()
            .execution_id
            .unwrap();

        assert!(cancel(&state, &id, "operator".into()).await.unwrap().ack);

        let mut mailbox = session.claim_mailbox().unwrap();
        let command = mailbox.cancels.try_recv().unwrap();
        assert_eq!(command.execution_id.as_deref(), Some(id.as_str()));
        assert_eq!(command.reason, "operator");
    }
}
