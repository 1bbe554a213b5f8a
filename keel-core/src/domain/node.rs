//! Node domain model
//!
//! Represents an execution host running the Keel agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registered execution node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier, chosen by the node itself
    pub id: String,

    pub alias: Option<String>,

    pub model: Option<String>,

    /// Node type, e.g. `physical` or `virtual`
    pub node_type: String,

    pub location: Option<String>,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Operator-set state, preserved across re-registration
    pub static_state: NodeStaticState,

    /// Opaque hardware inventory
    #[serde(default)]
    pub hardware: HashMap<String, String>,

    /// Opaque system inventory
    #[serde(default)]
    pub system: HashMap<String, String>,

    pub status: NodeStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            alias: None,
            model: None,
            node_type: node_type.into(),
            location: None,
            labels: HashMap::new(),
            static_state: NodeStaticState::Normal,
            hardware: HashMap::new(),
            system: HashMap::new(),
            status: NodeStatus::offline(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_online(&mut self) {
        let now = Utc::now();
        self.status.online = true;
        self.status.last_online = Some(now);
        self.status.updated_at = now;
        self.updated_at = now;
    }

    pub fn mark_offline(&mut self) {
        let now = Utc::now();
        self.status.online = false;
        self.status.updated_at = now;
        self.updated_at = now;
    }
}

/// Operator-controlled node state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStaticState {
    #[default]
    Normal,
    Maintenance,
    Disabled,
}

impl std::fmt::Display for NodeStaticState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStaticState::Normal => write!(f, "normal"),
            NodeStaticState::Maintenance => write!(f, "maintenance"),
            NodeStaticState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Live status of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub online: bool,
    pub last_online: Option<DateTime<Utc>>,
    pub metrics: Option<NodeMetrics>,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    fn offline() -> Self {
        Self {
            online: false,
            last_online: None,
            metrics: None,
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time resource usage reported by a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    #[serde(default)]
    pub gpus: Vec<GpuMetrics>,
    #[serde(default)]
    pub network: Option<NetworkMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuMetrics {
    pub index: u32,
    pub usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub rx_bytes_per_sec: u64,
    pub tx_bytes_per_sec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_offline_and_normal() {
        let node = Node::new("node-1", "physical");
        assert!(!node.status.online);
        assert_eq!(node.static_state, NodeStaticState::Normal);
    }

    #[test]
    fn test_mark_online_stamps_last_online() {
        let mut node = Node::new("node-1", "physical");
        node.mark_online();
        assert!(node.status.online);
        assert!(node.status.last_online.is_some());

        node.mark_offline();
        assert!(!node.status.online);
        assert!(node.status.last_online.is_some());
    }

    #[test]
    fn test_static_state_serializes_snake_case() {
        let json = serde_json::to_string(&NodeStaticState::Maintenance).unwrap();
        assert_eq!(json, "\"maintenance\"");
    }
}
