//! Agent against a live dispatch server: HTTP on a loopback port, the node
//! stream over an in-memory channel pair, containers faked by image name.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use keel_agent::connection::{ConnectionManager, StreamDialer};
use keel_agent::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};
use keel_agent::{Config as AgentConfig, Coordinator};
use keel_client::DispatchClient;
use keel_core::domain::log::LogSource;
use keel_core::domain::pipeline::{
    ContainerConfig, Pipeline, PipelineDefinition, PipelineState, PipelineStep, StepKind,
    StepState,
};
use keel_core::dto::pipeline::ExecutePipeline;
use keel_core::dto::stream::{StreamRequest, StreamResponse};
use keel_core::retry::RetryConfig;
use keel_core::transport::{AgentStream, ChannelStream, TransportError};
use keel_dispatch::dispatch::DispatchServer;
use keel_dispatch::{AppState, Config as ServerConfig, api};

const NODE_ID: &str = "node-1";

/// `fail` exits 2, `hang` runs until stopped, anything else exits 0
#[derive(Default)]
struct FakeRuntime {
    images: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let mut images = self.images.lock().unwrap();
        let id = format!("ctr-{}", images.len());
        images.insert(id.clone(), spec.image.clone());
        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let image = self.images.lock().unwrap()[&handle.id].clone();
        match image.as_str() {
            "fail" => Ok(2),
            "hang" => std::future::pending().await,
            _ => Ok(0),
        }
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<String>, RuntimeError> {
        Ok(vec![format!(
            "2024-05-01T10:00:00Z stdout hello from {}",
            handle.name
        )])
    }

    async fn stop(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Hands every dial straight to the dispatch server's stream handler
struct ChannelDialer {
    dispatch: Arc<DispatchServer>,
}

#[async_trait]
impl StreamDialer for ChannelDialer {
    async fn dial(&self) -> Result<AgentStream, TransportError> {
        let (server_end, agent_end) = ChannelStream::<StreamRequest, StreamResponse>::pair(16);
        let dispatch = self.dispatch.clone();
        tokio::spawn(async move {
            let _ = dispatch.serve_stream(Box::new(server_end)).await;
        });
        Ok(Box::new(agent_end))
    }
}

struct Harness {
    state: AppState,
    client: DispatchClient,
    /// Agent shutdown
    token: CancellationToken,
    server_token: CancellationToken,
    agent: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(agent_max_parallel: usize, server_max_pipelines: usize) -> Self {
        let state = AppState::in_memory(&ServerConfig {
            heartbeat_period: Duration::from_secs(1),
            max_pipelines_per_node: server_max_pipelines,
            ..Default::default()
        });
        let token = CancellationToken::new();
        let server_token = CancellationToken::new();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_url = format!("http://{}", listener.local_addr().unwrap());
        let app = api::create_router(state.clone());
        let http_token = server_token.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_token.cancelled().await })
                .await
        });

        let config = AgentConfig {
            node_id: NODE_ID.to_string(),
            server_url: server_url.clone(),
            stream_addr: "in-memory".to_string(),
            heartbeat_period: Duration::from_millis(200),
            max_parallel: agent_max_parallel,
            reconnect_delay: Duration::from_millis(100),
            retry: RetryConfig {
                max_retries: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let connection = Arc::new(ConnectionManager::new(
            NODE_ID,
            local_client(&server_url),
            Box::new(ChannelDialer {
                dispatch: state.dispatch.clone(),
            }),
            config.retry.clone(),
            CancellationToken::new(),
        ));
        let coordinator = Coordinator::new(
            config,
            connection,
            Arc::new(FakeRuntime::default()),
            token.clone(),
        );
        let agent = tokio::spawn(coordinator.run());

        let dispatch = state.dispatch.clone();
        eventually("node stream", || {
            let dispatch = dispatch.clone();
            async move { dispatch.session(NODE_ID).is_some() }
        })
        .await;

        Self {
            state,
            client: local_client(&server_url),
            token,
            server_token,
            agent,
        }
    }

    async fn submit(&self, images: &[&str]) -> String {
        let response = self
            .client
            .execute_pipeline(&ExecutePipeline {
                node_id: NODE_ID.to_string(),
                pipeline: definition(images),
                envs: HashMap::new(),
                args: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(response.accepted, "rejected: {}", response.message);
        response.execution_id.unwrap()
    }

    async fn wait_for_state(&self, execution_id: &str, state: PipelineState) -> Pipeline {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let pipeline = self.client.get_execution(execution_id).await.unwrap();
            if pipeline.state() == state {
                return pipeline;
            }
            assert!(
                Instant::now() < deadline,
                "{} stuck in {} waiting for {}",
                execution_id,
                pipeline.state(),
                state
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stop(self) {
        self.token.cancel();
        self.agent.await.unwrap().unwrap();
        self.server_token.cancel();
    }
}

/// Loopback requests must not go through a proxy from the environment
fn local_client(url: &str) -> DispatchClient {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    DispatchClient::with_client(url, client)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn definition(images: &[&str]) -> PipelineDefinition {
    PipelineDefinition {
        name: "integration".to_string(),
        description: None,
        envs: HashMap::new(),
        args: HashMap::new(),
        steps: images
            .iter()
            .enumerate()
            .map(|(i, image)| PipelineStep {
                name: format!("step-{}", i),
                kind: StepKind::Container,
                container: ContainerConfig {
                    image: image.to_string(),
                    commands: vec!["run".to_string()],
                    ..Default::default()
                },
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_registered_node_runs_pipeline_to_completion() {
    let h = Harness::start(2, 2).await;

    let node = h.client.get_node(NODE_ID).await.unwrap();
    assert!(node.connected);
    assert!(node.status.online);
    let record = h.state.nodes.get(NODE_ID).await.unwrap().unwrap();
    assert_eq!(record.system["os"], std::env::consts::OS);

    let id = h.submit(&["ok", "ok"]).await;
    let pipeline = h.wait_for_state(&id, PipelineState::Completed).await;

    assert_eq!(pipeline.progress(), 1.0);
    for step in &pipeline.status().steps {
        assert_eq!(step.state, StepState::Completed);
    }
    assert_eq!(pipeline.status().node_id.as_deref(), Some(NODE_ID));

    let logs = h.state.logs.query_since(&id, None);
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|e| e.source == LogSource::Stdout));

    // the finished execution no longer counts against the node
    let dispatch = h.state.dispatch.clone();
    eventually("claimed sources to clear", || {
        let dispatch = dispatch.clone();
        async move {
            dispatch
                .session(NODE_ID)
                .is_some_and(|s| s.claimed_sources().is_empty())
        }
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_failed_step_is_mirrored() {
    let h = Harness::start(2, 2).await;

    let id = h.submit(&["ok", "fail", "ok"]).await;
    let pipeline = h.wait_for_state(&id, PipelineState::Failed).await;

    assert_eq!(pipeline.step_status(0).unwrap().state, StepState::Completed);
    assert_eq!(pipeline.step_status(1).unwrap().state, StepState::Failed);
    assert_eq!(pipeline.step_status(2).unwrap().state, StepState::Pending);
    let message = pipeline.status().error_message.clone().unwrap();
    assert!(message.contains("exited with code 2"));

    h.stop().await;
}

#[tokio::test]
async fn test_cancel_reaches_running_pipeline() {
    let h = Harness::start(2, 2).await;

    let id = h.submit(&["hang", "ok"]).await;
    h.wait_for_state(&id, PipelineState::Running).await;

    let ack = h.client.cancel_pipeline(&id, "operator").await.unwrap();
    assert!(ack.ack);

    let pipeline = h.wait_for_state(&id, PipelineState::Canceled).await;
    assert_eq!(pipeline.status().error_message.as_deref(), Some("operator"));
    assert_eq!(pipeline.step_status(1).unwrap().state, StepState::Pending);

    h.stop().await;
}

#[tokio::test]
async fn test_agent_rejects_assignment_over_its_limit() {
    // the server would allow three, the agent runs one
    let h = Harness::start(1, 3).await;

    let running = h.submit(&["hang"]).await;
    let dispatch = h.state.dispatch.clone();
    let claimed = running.clone();
    eventually("first execution to be claimed", || {
        let dispatch = dispatch.clone();
        let claimed = claimed.clone();
        async move {
            dispatch
                .session(NODE_ID)
                .is_some_and(|s| s.claimed_sources() == vec![claimed])
        }
    })
    .await;

    let rejected = h.submit(&["ok"]).await;
    let pipeline = h.wait_for_state(&rejected, PipelineState::Failed).await;
    assert_eq!(
        pipeline.status().error_message.as_deref(),
        Some("node at capacity")
    );

    h.client.cancel_pipeline(&running, "cleanup").await.unwrap();
    h.wait_for_state(&running, PipelineState::Canceled).await;

    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_reports_final_status() {
    let h = Harness::start(2, 2).await;

    let id = h.submit(&["hang"]).await;
    h.wait_for_state(&id, PipelineState::Running).await;

    let Harness {
        client,
        token,
        server_token,
        agent,
        ..
    } = h;
    token.cancel();
    agent.await.unwrap().unwrap();

    // the agent is gone, so the mirror must already hold the final state
    let pipeline = client.get_execution(&id).await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Canceled);
    assert_eq!(pipeline.step_status(0).unwrap().state, StepState::Failed);

    server_token.cancel();
}
