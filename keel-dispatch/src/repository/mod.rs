//! Repository Module
//!
//! Data access layer for the dispatch server. Catalogs are traits so durable
//! backends can be plugged in; the in-memory implementations here are what
//! the binary uses.

pub mod log;
pub mod node;
pub mod pipeline;

// Re-export for convenience
pub use log as log_repository;
pub use node as node_repository;
pub use pipeline as pipeline_repository;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("record {0} already exists")]
    Conflict(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}
