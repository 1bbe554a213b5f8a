//! Agent coordinator
//!
//! Registers the node, keeps the node stream alive and turns the frames it
//! receives into pipeline executions. Connection handling is delegated to a
//! [`ConnectionManager`]; execution to one [`PipelineEngine`] per pipeline.

use anyhow::Context;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use keel_core::domain::pipeline::{Pipeline, PipelineDefinition, PipelineState};
use keel_core::dto::node::{RegisterNode, ResourceInfo};
use keel_core::dto::stream::{CancelCommand, PipelineAssignment, StreamRequest, StreamResponse};
use keel_core::event::EventBus;
use keel_core::transport::AgentStream;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::engine::{EngineError, PipelineEngine};
use crate::reporter::Reporter;
use crate::runtime::ContainerRuntime;

/// Per-execution engine event queue
const EVENT_QUEUE: usize = 256;

const SERVER_CANCEL_REASON: &str = "canceled by dispatch server";

type ActiveSet = Arc<Mutex<HashMap<String, Arc<PipelineEngine>>>>;

pub struct Coordinator {
    config: Config,
    connection: Arc<ConnectionManager>,
    runtime: Arc<dyn ContainerRuntime>,
    active: ActiveSet,
    finished_tx: mpsc::UnboundedSender<String>,
    finished_rx: mpsc::UnboundedReceiver<String>,
    tasks: TaskTracker,
    token: CancellationToken,
}

impl Coordinator {
    /// Cancelling `token` shuts the coordinator down and cancels every
    /// running pipeline. `connection` stays usable until their final status
    /// is reported.
    pub fn new(
        config: Config,
        connection: Arc<ConnectionManager>,
        runtime: Arc<dyn ContainerRuntime>,
        token: CancellationToken,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connection,
            runtime,
            active: Arc::new(Mutex::new(HashMap::new())),
            finished_tx,
            finished_rx,
            tasks: TaskTracker::new(),
            token,
        }
    }

    /// Execution IDs currently running, sorted
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Registers, then serves the node stream until shut down.
    ///
    /// A rejected registration is fatal. A broken stream is redialed after
    /// the configured reconnect delay.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.token.cancelled() => {
                self.connection.close();
                return Ok(());
            }
            registered = self.register() => {
                if let Err(e) = registered {
                    self.connection.close();
                    return Err(e);
                }
            }
        }

        loop {
            match self.run_stream().await {
                Ok(()) if self.token.is_cancelled() => break,
                Ok(()) => warn!("Node stream closed by server"),
                Err(e) if self.token.is_cancelled() => debug!("Node stream ended on shutdown: {:#}", e),
                Err(e) => warn!("Node stream failed: {:#}", e),
            }
            if self.token.is_cancelled() {
                break;
            }

            info!("Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn register(&self) -> anyhow::Result<()> {
        let request = RegisterNode {
            node_id: self.config.node_id.clone(),
            node_type: self.config.node_type.clone(),
            labels: self.config.labels.clone(),
            ..Default::default()
        };

        let response = self
            .connection
            .register(&request)
            .await
            .context("Node registration failed")?;
        if let Some(state) = response.static_state {
            info!("Node {} static state: {}", self.config.node_id, state);
        }

        if let Err(e) = self.connection.update_resource_info(&resource_info()).await {
            warn!("Failed to report resource info: {}", e);
        }
        Ok(())
    }

    // =============================================================================
    // Stream
    // =============================================================================

    async fn run_stream(&mut self) -> anyhow::Result<()> {
        let mut stream = tokio::select! {
            _ = self.token.cancelled() => return Ok(()),
            stream = self.connection.open_stream() => {
                stream.context("Failed to open node stream")?
            }
        };
        info!("Node stream established");

        self.send_heartbeat(&mut stream).await?;

        let mut ticker = tokio::time::interval(self.config.heartbeat_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    self.send_heartbeat(&mut stream).await?;
                    self.spawn_unary_heartbeat();
                }
                frame = stream.recv() => {
                    match frame.context("Failed to read from node stream")? {
                        Some(response) => {
                            if self.handle_response(response) {
                                self.send_heartbeat(&mut stream).await?;
                            }
                        }
                        None => return Ok(()),
                    }
                }
                Some(execution_id) = self.finished_rx.recv() => {
                    debug!("Execution {} released", execution_id);
                    // frees the slot on the server right away
                    self.send_heartbeat(&mut stream).await?;
                }
            }
        }
    }

    async fn send_heartbeat(&self, stream: &mut AgentStream) -> anyhow::Result<()> {
        let frame = StreamRequest::heartbeat(self.connection.node_id(), self.active_ids());
        stream
            .send(frame)
            .await
            .context("Failed to send heartbeat")
    }

    fn spawn_unary_heartbeat(&self) {
        let connection = self.connection.clone();
        tokio::spawn(async move {
            match connection.heartbeat(None).await {
                Ok(ack) if !ack.ack => warn!("Heartbeat not acknowledged, node unknown to server"),
                Ok(_) => {}
                Err(e) => debug!("Unary heartbeat failed: {}", e),
            }
        });
    }

    /// Returns true when the set of active executions grew
    fn handle_response(&mut self, response: StreamResponse) -> bool {
        match response {
            StreamResponse::HeartbeatAck { .. } => {
                debug!("Heartbeat acknowledged");
                false
            }
            StreamResponse::Assignment(assignment) => self.accept(assignment),
            StreamResponse::Cancel(command) => {
                self.cancel(command);
                false
            }
        }
    }

    // =============================================================================
    // Executions
    // =============================================================================

    fn accept(&mut self, assignment: PipelineAssignment) -> bool {
        let PipelineAssignment {
            execution_id,
            pipeline: definition,
        } = assignment;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&execution_id) {
            warn!("Execution {} is already running, ignoring assignment", execution_id);
            return false;
        }
        if active.len() >= self.config.max_parallel {
            drop(active);
            warn!(
                "Rejecting execution {}: {} pipelines already running",
                execution_id, self.config.max_parallel
            );
            self.reject(execution_id, definition, "node at capacity");
            return false;
        }

        let mut pipeline = Pipeline::new(&execution_id, definition);
        pipeline.set_node(self.connection.node_id());
        let pipeline = Arc::new(Mutex::new(pipeline));

        let events = Arc::new(EventBus::new(EVENT_QUEUE));
        let subscription = events.subscribe(&[]);
        let engine = Arc::new(PipelineEngine::new(
            self.runtime.clone(),
            events,
            &self.token,
        ));
        active.insert(execution_id.clone(), engine.clone());
        drop(active);

        info!("Accepted execution {}", execution_id);
        let reporter = Reporter::new(self.connection.clone());
        let active = self.active.clone();
        let finished = self.finished_tx.clone();

        self.tasks.spawn(async move {
            let reporting = tokio::spawn(reporter.run(subscription));

            match engine.execute(&pipeline).await {
                Ok(()) => info!("Execution {} completed", execution_id),
                Err(EngineError::Canceled(reason)) => {
                    info!("Execution {} canceled: {}", execution_id, reason)
                }
                Err(e) => warn!("Execution {} failed: {}", execution_id, e),
            }

            // dropping the last engine handle closes the event bus, which
            // ends the reporter even if its terminal event was dropped
            active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&execution_id);
            drop(engine);
            if let Err(e) = reporting.await {
                warn!("Reporter of {} panicked: {}", execution_id, e);
            }

            let _ = finished.send(execution_id);
        });
        true
    }

    /// Reports an assignment that will not run as failed
    fn reject(&self, execution_id: String, definition: PipelineDefinition, reason: &str) {
        let mut pipeline = Pipeline::new(&execution_id, definition);
        pipeline.set_node(self.connection.node_id());
        if let Err(e) = pipeline.update_pipeline_state(PipelineState::Failed) {
            warn!("Cannot mark {} failed: {}", execution_id, e);
            return;
        }
        pipeline.set_error(reason);

        let status = pipeline.status().clone();
        let connection = self.connection.clone();
        self.tasks.spawn(async move {
            if let Err(e) = connection.update_pipeline_status(&execution_id, &status).await {
                warn!("Failed to report rejection of {}: {}", execution_id, e);
            }
        });
    }

    fn cancel(&self, command: CancelCommand) {
        let reason = if command.reason.is_empty() {
            SERVER_CANCEL_REASON.to_string()
        } else {
            command.reason
        };

        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match command.execution_id {
            Some(id) => match active.get(&id) {
                Some(engine) => {
                    info!("Canceling execution {}: {}", id, reason);
                    engine.cancel(reason);
                }
                None => debug!("Cancel for execution {} which is not running", id),
            },
            None => {
                info!("Canceling all {} executions: {}", active.len(), reason);
                for engine in active.values() {
                    engine.cancel(reason.clone());
                }
            }
        }
    }

    /// Waits for running executions to report their final status, then
    /// closes the connection. Reports still retrying after the grace period
    /// are abandoned.
    async fn shutdown(&self) {
        info!("Waiting for {} executions to stop", self.active_ids().len());
        self.tasks.close();
        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!("Final status reports still pending after {:?}, abandoning", grace);
        }
        self.connection.close();
        self.tasks.wait().await;
    }
}

/// Static inventory; hardware sampling is out of scope
fn resource_info() -> ResourceInfo {
    let mut hardware = HashMap::new();
    if let Ok(cpus) = std::thread::available_parallelism() {
        hardware.insert("cpus".to_string(), cpus.to_string());
    }

    let system = HashMap::from([
        ("os".to_string(), std::env::consts::OS.to_string()),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "agent_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ]);

    ResourceInfo { hardware, system }
}
