//! Node DTOs
//!
//! Data transfer objects for node registration, heartbeats and inventory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::node::{Node, NodeMetrics, NodeStaticState, NodeStatus};

/// Request to register a node with the dispatch server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterNode {
    pub node_id: String,
    pub node_type: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl RegisterNode {
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("node id is required".to_string());
        }
        if self.node_type.trim().is_empty() {
            return Err("node type is required".to_string());
        }
        Ok(())
    }
}

/// Outcome of a registration.
///
/// Validation failures are reported here with `success: false`, never as a
/// transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub message: String,
    pub session_token: Option<String>,
    pub static_state: Option<NodeStaticState>,
}

impl RegisterResponse {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session_token: None,
            static_state: None,
        }
    }
}

/// Unary heartbeat
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
}

/// Metrics report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub metrics: NodeMetrics,
}

/// Hardware and system inventory update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(default)]
    pub hardware: HashMap<String, String>,
    #[serde(default)]
    pub system: HashMap<String, String>,
}

/// Node record joined with its live session, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub node_type: String,
    pub alias: Option<String>,
    pub static_state: NodeStaticState,
    pub status: NodeStatus,
    /// Whether the node currently holds an open stream
    pub connected: bool,
    /// Execution IDs the node last reported as active
    pub claimed_sources: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeSummary {
    pub fn offline(node: Node) -> Self {
        Self {
            id: node.id,
            node_type: node.node_type,
            alias: node.alias,
            static_state: node.static_state,
            status: node.status,
            connected: false,
            claimed_sources: Vec::new(),
            last_seen: None,
        }
    }
}
