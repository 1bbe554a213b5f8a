//! Node-related API endpoints

use crate::DispatchClient;
use crate::error::Result;
use keel_core::domain::node::NodeMetrics;
use keel_core::dto::Ack;
use keel_core::dto::node::{
    HeartbeatRequest, MetricsReport, NodeSummary, RegisterNode, RegisterResponse, ResourceInfo,
};

impl DispatchClient {
    // =============================================================================
    // Registration & Liveness
    // =============================================================================

    /// Register a node. Re-registering an existing ID is idempotent.
    ///
    /// A validation failure comes back as `success: false`, not as an error.
    pub async fn register_node(&self, request: &RegisterNode) -> Result<RegisterResponse> {
        self.post_json("/api/nodes/register", request).await
    }

    /// Unary heartbeat; `ack: false` means the server does not know the node
    pub async fn heartbeat(
        &self,
        node_id: &str,
        session_token: Option<&str>,
        metrics: Option<NodeMetrics>,
    ) -> Result<Ack> {
        let body = HeartbeatRequest {
            session_token: session_token.map(str::to_string),
            metrics,
        };
        self.post_json(&format!("/api/nodes/{}/heartbeat", node_id), &body)
            .await
    }

    pub async fn report_metrics(&self, node_id: &str, metrics: NodeMetrics) -> Result<Ack> {
        self.post_json(
            &format!("/api/nodes/{}/metrics", node_id),
            &MetricsReport { metrics },
        )
        .await
    }

    pub async fn update_resource_info(&self, node_id: &str, info: &ResourceInfo) -> Result<Ack> {
        self.post_json(&format!("/api/nodes/{}/resources", node_id), info)
            .await
    }

    // =============================================================================
    // Node Query
    // =============================================================================

    pub async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        self.get_json("/api/nodes").await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<NodeSummary> {
        self.get_json(&format!("/api/nodes/{}", node_id)).await
    }
}
