//! Node Service
//!
//! Registration, liveness and inventory of nodes.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel_core::domain::node::{Node, NodeMetrics};
use keel_core::dto::Ack;
use keel_core::dto::node::{NodeSummary, RegisterNode, RegisterResponse, ResourceInfo};
use crate::dispatch::LivenessChange;
use crate::repository::RepositoryError;
use crate::state::AppState;

/// Service error type
#[derive(Debug)]
pub enum NodeError {
    NotFound(String),
    RepositoryError(RepositoryError),
}

impl From<RepositoryError> for NodeError {
    fn from(err: RepositoryError) -> Self {
        NodeError::RepositoryError(err)
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Register a node, or refresh an existing registration
///
/// Invalid requests are answered with `success: false`. An existing node keeps
/// its operator-set static state.
pub async fn register(state: &AppState, req: RegisterNode) -> Result<RegisterResponse> {
    if let Err(msg) = req.validate() {
        tracing::warn!("Rejected registration: {}", msg);
        return Ok(RegisterResponse::rejected(msg));
    }

    let node = match state.nodes.get(&req.node_id).await? {
        Some(mut node) => {
            node.node_type = req.node_type;
            node.alias = req.alias.or(node.alias);
            node.model = req.model.or(node.model);
            node.location = req.location.or(node.location);
            if !req.labels.is_empty() {
                node.labels = req.labels;
            }
            node.mark_online();
            state.nodes.update(node).await?
        }
        None => {
            let mut node = Node::new(req.node_id, req.node_type);
            node.alias = req.alias;
            node.model = req.model;
            node.location = req.location;
            node.labels = req.labels;
            node.mark_online();
            state.nodes.create(node).await?
        }
    };

    let token = format!(
        "{}-{}",
        node.id,
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    tracing::info!("Node registered: {} ({})", node.id, node.static_state);

    Ok(RegisterResponse {
        success: true,
        message: "registered".to_string(),
        session_token: Some(token),
        static_state: Some(node.static_state),
    })
}

/// Record a unary heartbeat. Unknown nodes get `ack: false`.
pub async fn heartbeat(state: &AppState, node_id: &str, metrics: Option<NodeMetrics>) -> Result<Ack> {
    let Some(mut node) = state.nodes.get(node_id).await? else {
        tracing::debug!("Heartbeat from unknown node: {}", node_id);
        return Ok(Ack::no());
    };

    node.mark_online();
    if metrics.is_some() {
        node.status.metrics = metrics;
    }
    state.nodes.update(node).await?;
    Ok(Ack::yes())
}

pub async fn report_metrics(state: &AppState, node_id: &str, metrics: NodeMetrics) -> Result<Ack> {
    let Some(mut node) = state.nodes.get(node_id).await? else {
        return Ok(Ack::no());
    };

    node.status.metrics = Some(metrics);
    node.status.updated_at = Utc::now();
    state.nodes.update(node).await?;
    Ok(Ack::yes())
}

pub async fn update_resource_info(state: &AppState, node_id: &str, info: ResourceInfo) -> Result<Ack> {
    let Some(mut node) = state.nodes.get(node_id).await? else {
        return Ok(Ack::no());
    };

    node.hardware = info.hardware;
    node.system = info.system;
    node.updated_at = Utc::now();
    state.nodes.update(node).await?;
    Ok(Ack::yes())
}

/// Node record joined with its live session
pub async fn get_node(state: &AppState, node_id: &str) -> Result<NodeSummary> {
    let node = state
        .nodes
        .get(node_id)
        .await?
        .ok_or_else(|| NodeError::NotFound(node_id.to_string()))?;
    Ok(summarize(state, node))
}

pub async fn list_nodes(state: &AppState) -> Result<Vec<NodeSummary>> {
    let nodes = state.nodes.list().await?;
    Ok(nodes.into_iter().map(|n| summarize(state, n)).collect())
}

fn summarize(state: &AppState, node: Node) -> NodeSummary {
    let session = state.dispatch.session(&node.id);
    let mut summary = NodeSummary::offline(node);
    if let Some(session) = session {
        summary.connected = true;
        summary.claimed_sources = session.claimed_sources();
        summary.last_seen = Some(session.last_seen_at());
    }
    summary
}

/// Applies stream connects and evictions from
/// [`DispatchServer::watch_liveness`](crate::dispatch::DispatchServer::watch_liveness)
/// to the node catalog until `token` is cancelled
pub async fn track_liveness(
    state: AppState,
    mut changes: mpsc::UnboundedReceiver<LivenessChange>,
    token: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        let Ok(Some(mut node)) = state.nodes.get(&change.node_id).await else {
            continue;
        };
        if change.online {
            node.mark_online();
        } else {
            tracing::warn!("Node {} marked offline", node.id);
            node.mark_offline();
        }
        if let Err(e) = state.nodes.update(node).await {
            tracing::error!("Failed to update node liveness: {}", e);
        }
    }
}
