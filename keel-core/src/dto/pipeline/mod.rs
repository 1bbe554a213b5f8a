//! Pipeline DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::log::LogEntry;
use crate::domain::pipeline::{PipelineDefinition, PipelineStatus, StepStatus};

/// Request to execute a pipeline on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePipeline {
    pub node_id: String,
    pub pipeline: PipelineDefinition,
    /// Overlaid on top of the definition's envs
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Overlaid on top of the definition's args
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePipelineResponse {
    pub accepted: bool,
    pub execution_id: Option<String>,
    pub message: String,
}

/// Full status report for an execution, sent by the executing agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePipelineStatus {
    pub status: PipelineStatus,
}

/// Status report for a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStepStatus {
    pub status: StepStatus,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelPipeline {
    #[serde(default)]
    pub reason: String,
}
