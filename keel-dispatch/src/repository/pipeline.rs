//! Pipeline Repository
//!
//! Catalog of executions as mirrored from the agents running them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use keel_core::domain::pipeline::Pipeline;

use super::RepositoryError;

/// In-place edit applied to a stored pipeline
pub type PipelineUpdate = Box<dyn for<'p> FnOnce(&'p mut Pipeline) + Send>;

#[async_trait]
pub trait PipelineCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError>;

    async fn create(&self, pipeline: Pipeline) -> Result<Pipeline, RepositoryError>;

    /// Applies `f` to the stored pipeline under the catalog's lock.
    ///
    /// Returns the updated copy, `NotFound` if the ID is unknown.
    async fn update(
        &self,
        id: &str,
        f: PipelineUpdate,
    ) -> Result<Pipeline, RepositoryError>;

    async fn remove(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError>;

    async fn list(&self) -> Result<Vec<Pipeline>, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPipelineCatalog {
    pipelines: RwLock<HashMap<String, Pipeline>>,
}

impl InMemoryPipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineCatalog for InMemoryPipelineCatalog {
    async fn get(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError> {
        Ok(self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn create(&self, pipeline: Pipeline) -> Result<Pipeline, RepositoryError> {
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if pipelines.contains_key(pipeline.id()) {
            return Err(RepositoryError::Conflict(pipeline.id().to_string()));
        }
        pipelines.insert(pipeline.id().to_string(), pipeline.clone());
        Ok(pipeline)
    }

    async fn update(
        &self,
        id: &str,
        f: PipelineUpdate,
    ) -> Result<Pipeline, RepositoryError> {
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pipeline = pipelines
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        f(pipeline);
        Ok(pipeline.clone())
    }

    async fn remove(&self, id: &str) -> Result<Option<Pipeline>, RepositoryError> {
        Ok(self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id))
    }

    async fn list(&self) -> Result<Vec<Pipeline>, RepositoryError> {
        Ok(self
            .pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}
