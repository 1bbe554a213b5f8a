//! Keel HTTP Client
//!
//! A type-safe HTTP client for the unary RPCs of the Keel dispatch server and
//! its log streaming endpoint. Used by the agent and by anything that submits
//! pipelines.
//!
//! # Example
//!
//! ```no_run
//! use keel_client::DispatchClient;
//! use keel_core::domain::pipeline::PipelineDefinition;
//! use keel_core::dto::pipeline::ExecutePipeline;
//!
//! # async fn example(definition: PipelineDefinition) -> keel_client::Result<()> {
//! let client = DispatchClient::new("http://localhost:8080");
//!
//! let response = client
//!     .execute_pipeline(&ExecutePipeline {
//!         node_id: "node-01".to_string(),
//!         pipeline: definition,
//!         envs: Default::default(),
//!         args: Default::default(),
//!     })
//!     .await?;
//!
//! if let Some(id) = response.execution_id {
//!     tracing::info!("submitted execution {}", id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod nodes;
mod pipelines;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// HTTP client for the Keel dispatch server API
///
/// Methods are grouped by resource:
/// - Node registration, heartbeats, metrics and inventory
/// - Execution submission, status mirroring and cancellation
/// - Log streaming
#[derive(Debug, Clone)]
pub struct DispatchClient {
    /// Base URL of the dispatch server (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

impl DispatchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client around a preconfigured reqwest `Client` (timeouts, TLS, ...)
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.client.get(self.url(path)).send().await?;
        self.handle_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        self.handle_response(response).await
    }

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = Self::check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        // Server errors are rendered as {"error": "..."}
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);

        Err(ClientError::api_error(status.as_u16(), message))
    }
}
