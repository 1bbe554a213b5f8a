//! Connection lifecycle
//!
//! Owns the HTTP client and the stream dialer of one agent. Every call goes
//! through the retry policy; callers only see the final outcome.

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use keel_client::{ClientError, DispatchClient};
use keel_core::domain::log::LogEntry;
use keel_core::domain::node::NodeMetrics;
use keel_core::domain::pipeline::{PipelineStatus, StepStatus};
use keel_core::dto::Ack;
use keel_core::dto::node::{RegisterNode, RegisterResponse, ResourceInfo};
use keel_core::retry::{RetryConfig, RetryError, RetryKind, RetryableError, retry};
use keel_core::transport::{self, AgentStream, TransportError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("request failed: {0}")]
    Client(#[from] RetryError<ClientError>),

    #[error("stream failed: {0}")]
    Stream(#[from] RetryError<TransportError>),

    #[error("registration rejected: {0}")]
    Rejected(String),
}

impl ConnectionError {
    pub fn is_canceled(&self) -> bool {
        match self {
            ConnectionError::Client(e) => e.is_canceled(),
            ConnectionError::Stream(e) => e.is_canceled(),
            ConnectionError::Rejected(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Opens the agent's end of a node stream
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial(&self) -> std::result::Result<AgentStream, TransportError>;
}

/// Dials the dispatch server's stream listener over TCP
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl StreamDialer for TcpDialer {
    async fn dial(&self) -> std::result::Result<AgentStream, TransportError> {
        transport::connect(self.addr.as_str()).await
    }
}

/// Classifies a dial or stream failure for [`retry`]
pub fn classify_transport(err: TransportError) -> RetryableError<TransportError> {
    let kind = match &err {
        TransportError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ) =>
        {
            RetryKind::RetryNow
        }
        TransportError::Io(_) | TransportError::Closed => RetryKind::Retry,
        TransportError::Frame(_) | TransportError::Decode(_) => RetryKind::Fatal,
    };
    RetryableError { kind, error: err }
}

pub struct ConnectionManager {
    node_id: String,
    client: DispatchClient,
    dialer: Box<dyn StreamDialer>,
    retry: RetryConfig,
    token: CancellationToken,
    session_token: Mutex<Option<String>>,
}

impl ConnectionManager {
    /// Retries stop once `token` is cancelled or [`close`](Self::close) is
    /// called
    pub fn new(
        node_id: impl Into<String>,
        client: DispatchClient,
        dialer: Box<dyn StreamDialer>,
        retry: RetryConfig,
        token: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            client,
            dialer,
            retry,
            token,
            session_token: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Abandons in-flight retries; later calls fail as canceled
    pub fn close(&self) {
        self.token.cancel();
    }

    fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn(DispatchClient) -> Fut,
        Fut: Future<Output = keel_client::Result<T>>,
    {
        let result = retry(&self.token, &self.retry, || {
            let attempt = f(self.client.clone());
            async move {
                attempt.await.map_err(|e| {
                    debug!("{} attempt failed: {}", op, e);
                    e.into_retryable()
                })
            }
        })
        .await?;
        Ok(result)
    }

    // =============================================================================
    // Registration
    // =============================================================================

    /// Registers the node; a `success: false` answer is an error
    pub async fn register(&self, request: &RegisterNode) -> Result<RegisterResponse> {
        let response = self
            .call("register", |c| async move { c.register_node(request).await })
            .await?;

        if !response.success {
            return Err(ConnectionError::Rejected(response.message));
        }

        *self
            .session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = response.session_token.clone();
        info!("Registered as {}", self.node_id);
        Ok(response)
    }

    pub async fn update_resource_info(&self, info: &ResourceInfo) -> Result<Ack> {
        let node_id = self.node_id.as_str();
        self.call("update_resource_info", |c| async move {
            c.update_resource_info(node_id, info).await
        })
        .await
    }

    /// Unary heartbeat, carrying the session token from registration
    pub async fn heartbeat(&self, metrics: Option<NodeMetrics>) -> Result<Ack> {
        let node_id = self.node_id.as_str();
        let token = self.session_token();
        let token = token.as_deref();
        self.call("heartbeat", |c| {
            let metrics = metrics.clone();
            async move { c.heartbeat(node_id, token, metrics).await }
        })
        .await
    }

    // =============================================================================
    // Status Reporting
    // =============================================================================

    pub async fn update_pipeline_status(
        &self,
        execution_id: &str,
        status: &PipelineStatus,
    ) -> Result<Ack> {
        self.call("update_pipeline_status", |c| async move {
            c.update_pipeline_status(execution_id, status).await
        })
        .await
    }

    pub async fn update_step_status(
        &self,
        execution_id: &str,
        status: &StepStatus,
        logs: &[LogEntry],
    ) -> Result<Ack> {
        self.call("update_step_status", |c| async move {
            c.update_step_status(execution_id, status, logs.to_vec())
                .await
        })
        .await
    }

    // =============================================================================
    // Stream
    // =============================================================================

    /// Dials the node stream
    pub async fn open_stream(&self) -> Result<AgentStream> {
        let stream = retry(&self.token, &self.retry, || async move {
            self.dialer.dial().await.map_err(|e| {
                debug!("dial attempt failed: {}", e);
                classify_transport(e)
            })
        })
        .await?;
        Ok(stream)
    }
}
