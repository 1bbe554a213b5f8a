//! Dispatch server
//!
//! Owns the registry of [`NodeSession`]s, routes assignments and cancellations
//! into them, drives each node's stream, and evicts nodes that stop
//! heartbeating.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel_core::dto::stream::{
    CancelCommand, PipelineAssignment, StreamRequest, StreamResponse,
};
use keel_core::event::{EventBus, FleetEvent};
use keel_core::transport::ServerStream;

use super::DispatchError;
use super::session::{Mailbox, NodeSession};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub heartbeat_period: Duration,
    pub max_pipelines_per_node: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(10),
            max_pipelines_per_node: 2,
        }
    }
}

impl DispatchConfig {
    /// How often the liveness sweep runs
    pub fn sweep_interval(&self) -> Duration {
        self.heartbeat_period / 2
    }

    /// Idle time after which a sweep evicts a session.
    ///
    /// Sweeps are `sweep_interval` apart, so a silent node is evicted no later
    /// than twice the heartbeat period.
    pub fn eviction_threshold(&self) -> Duration {
        self.heartbeat_period * 2 - self.sweep_interval()
    }
}

/// A node's stream connected or its session was evicted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    pub node_id: String,
    pub online: bool,
}

pub struct DispatchServer {
    config: DispatchConfig,
    sessions: RwLock<HashMap<String, Arc<NodeSession>>>,
    events: Arc<EventBus<FleetEvent>>,
    liveness: Mutex<Option<mpsc::UnboundedSender<LivenessChange>>>,
}

impl DispatchServer {
    pub fn new(config: DispatchConfig, events: Arc<EventBus<FleetEvent>>) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            events,
            liveness: Mutex::new(None),
        }
    }

    /// Lossless feed of connects and evictions, unlike the bounded event
    /// bus. Replaces any earlier watcher.
    pub fn watch_liveness(&self) -> mpsc::UnboundedReceiver<LivenessChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.liveness.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    fn notify_liveness(&self, node_id: &str, online: bool) {
        let mut watcher = self.liveness.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = watcher.as_ref() {
            let change = LivenessChange {
                node_id: node_id.to_string(),
                online,
            };
            if tx.send(change).is_err() {
                *watcher = None;
            }
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Returns the node's session, creating it if needed
    pub fn get_or_create(&self, node_id: &str) -> Arc<NodeSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(node_id.to_string())
            .or_insert_with(|| {
                debug!(node_id, "creating session");
                Arc::new(NodeSession::new(node_id))
            })
            .clone()
    }

    pub fn session(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<NodeSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queues a pipeline for delivery to a node.
    ///
    /// Fails with `NodeUnknown` when the node has no session and with
    /// `CapacityExceeded` when it already claims the maximum number of
    /// pipelines. Otherwise waits until the node's assignment slot is free.
    pub async fn assign(
        &self,
        node_id: &str,
        assignment: PipelineAssignment,
    ) -> Result<(), DispatchError> {
        let session = self
            .session(node_id)
            .ok_or_else(|| DispatchError::NodeUnknown(node_id.to_string()))?;

        let execution_id = assignment.execution_id.clone();
        session
            .enqueue_assignment(assignment, self.config.max_pipelines_per_node)
            .await?;

        info!(node_id, execution_id = %execution_id, "assignment queued");
        Ok(())
    }

    /// Queues a cancellation for a node. Returns false if the node is unknown.
    pub async fn cancel(&self, node_id: &str, command: CancelCommand) -> bool {
        let Some(session) = self.session(node_id) else {
            debug!(node_id, "cancel for unknown node ignored");
            return false;
        };

        match session.enqueue_cancel(command).await {
            Ok(()) => true,
            Err(e) => {
                debug!(node_id, "cancel not queued: {}", e);
                false
            }
        }
    }

    /// Removes `session` from the registry if it is still the registered one
    /// and closes it. Returns whether it was removed.
    pub fn evict(&self, session: &Arc<NodeSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            match sessions.get(session.node_id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.node_id());
                    true
                }
                _ => false,
            }
        };
        session.close();

        if removed {
            self.notify_liveness(session.node_id(), false);
            self.events
                .publish(FleetEvent::node(session.node_id(), "offline"));
        }
        removed
    }

    /// Drives one node stream until it ends.
    ///
    /// The first frame identifies the node. Inbound heartbeats update its
    /// claimed sources; queued assignments, cancellations and liveness ticks
    /// are sent one at a time. Any stream error evicts the session.
    pub async fn serve_stream(&self, mut stream: ServerStream) -> Result<(), DispatchError> {
        let first = match stream.recv().await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let node_id = first.node_id().to_string();
        if node_id.is_empty() {
            return Err(DispatchError::Protocol("empty node id".to_string()));
        }

        let session = self.get_or_create(&node_id);
        let Some(mut mailbox) = session.claim_mailbox() else {
            warn!(node_id = %node_id, "rejecting second stream");
            return Err(DispatchError::AlreadyConnected(node_id));
        };

        info!(node_id = %node_id, "node stream connected");
        self.notify_liveness(&node_id, true);
        self.events.publish(FleetEvent::node(&node_id, "online"));

        let result = self
            .drive(&session, &mut mailbox, &mut stream, first)
            .await;

        match &result {
            Ok(()) => info!(node_id = %node_id, "node stream closed"),
            Err(DispatchError::LivenessTimeout(_)) => {}
            Err(e) => error!(node_id = %node_id, "node stream failed: {}", e),
        }
        self.evict(&session);
        result
    }

    async fn drive(
        &self,
        session: &NodeSession,
        mailbox: &mut Mailbox,
        stream: &mut ServerStream,
        first: StreamRequest,
    ) -> Result<(), DispatchError> {
        self.handle_frame(session, first)?;

        loop {
            let outbound = tokio::select! {
                frame = stream.recv() => match frame? {
                    Some(frame) => {
                        self.handle_frame(session, frame)?;
                        continue;
                    }
                    None => return Ok(()),
                },
                _ = session.closed() => {
                    return Err(DispatchError::LivenessTimeout(session.node_id().to_string()));
                }
                Some(command) = mailbox.cancels.recv() => StreamResponse::Cancel(command),
                Some(assignment) = mailbox.assignments.recv() => StreamResponse::Assignment(assignment),
                Some(()) = mailbox.timeouts.recv() => StreamResponse::heartbeat_ack(),
            };

            stream.send(outbound).await?;
        }
    }

    fn handle_frame(&self, session: &NodeSession, frame: StreamRequest) -> Result<(), DispatchError> {
        match frame {
            StreamRequest::Heartbeat(hb) => {
                if hb.node_id != session.node_id() {
                    return Err(DispatchError::Protocol(format!(
                        "heartbeat for {} on stream of {}",
                        hb.node_id,
                        session.node_id()
                    )));
                }
                debug!(
                    node_id = %hb.node_id,
                    active = hb.active_task_ids.len(),
                    "stream heartbeat"
                );
                session.update_claimed(hb.active_task_ids);
                session.touch();
            }
        }
        Ok(())
    }

    /// One liveness pass: evicts idle sessions and offers a tick to the rest.
    ///
    /// Returns the IDs of evicted nodes.
    pub fn sweep(&self) -> Vec<String> {
        let threshold = self.config.eviction_threshold();
        let (stale, live): (Vec<_>, Vec<_>) = self
            .sessions()
            .into_iter()
            .partition(|s| s.idle_for() >= threshold);

        for session in &live {
            if !session.offer_timeout() {
                debug!(node_id = session.node_id(), "liveness tick still pending");
            }
        }

        let mut evicted = Vec::with_capacity(stale.len());
        for session in stale {
            warn!(
                node_id = session.node_id(),
                idle_ms = session.idle_for().as_millis() as u64,
                "node missed heartbeats, evicting"
            );
            if self.evict(&session) {
                evicted.push(session.node_id().to_string());
            }
        }
        evicted
    }

    /// Sweeps every `sweep_interval` until `token` is cancelled
    pub async fn run_liveness_sweep(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        debug!("liveness sweep stopped");
    }
}
