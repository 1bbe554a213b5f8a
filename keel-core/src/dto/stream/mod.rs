//! Node stream frames
//!
//! A node opens one stream to the dispatch server. It only ever sends
//! [`StreamRequest`] frames and only ever receives [`StreamResponse`] frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pipeline::PipelineDefinition;

/// Frame sent by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamRequest {
    Heartbeat(StreamHeartbeat),
}

impl StreamRequest {
    pub fn heartbeat(node_id: impl Into<String>, active_task_ids: Vec<String>) -> Self {
        StreamRequest::Heartbeat(StreamHeartbeat {
            node_id: node_id.into(),
            active_task_ids,
            timestamp: Utc::now(),
        })
    }

    pub fn node_id(&self) -> &str {
        match self {
            StreamRequest::Heartbeat(hb) => &hb.node_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeartbeat {
    pub node_id: String,
    /// Execution IDs the node is running right now
    #[serde(default)]
    pub active_task_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Frame sent by the dispatch server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResponse {
    HeartbeatAck { timestamp: DateTime<Utc> },
    Assignment(PipelineAssignment),
    Cancel(CancelCommand),
}

impl StreamResponse {
    pub fn heartbeat_ack() -> Self {
        StreamResponse::HeartbeatAck {
            timestamp: Utc::now(),
        }
    }
}

/// A pipeline the node should start executing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineAssignment {
    pub execution_id: String,
    /// Definition with request-level envs and args already merged in
    pub pipeline: PipelineDefinition,
}

/// Request to stop a running pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCommand {
    /// `None` cancels every pipeline on the node
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub reason: String,
}
