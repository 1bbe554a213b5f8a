//! Service Module
//!
//! Business logic layer for the dispatch server.
//! Services orchestrate between repositories, the dispatch server and the
//! event bus.

pub mod log;
pub mod node;
pub mod pipeline;

// Re-export for convenience
pub use log as log_service;
pub use node as node_service;
pub use pipeline as pipeline_service;
