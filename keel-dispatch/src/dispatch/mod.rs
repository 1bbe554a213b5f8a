//! Node dispatch
//!
//! Session registry, per-node stream handling and liveness sweeping.

pub mod listener;
pub mod server;
pub mod session;

pub use server::{DispatchConfig, DispatchServer, LivenessChange};
pub use session::NodeSession;

use keel_core::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} is not connected")]
    NodeUnknown(String),

    #[error("node {node_id} is at capacity ({claimed}/{max} pipelines)")]
    CapacityExceeded {
        node_id: String,
        claimed: usize,
        max: usize,
    },

    #[error("node {0} already has an open stream")]
    AlreadyConnected(String),

    #[error("stream error: {0}")]
    Transport(#[from] TransportError),

    #[error("node {0} missed its heartbeat deadline")]
    LivenessTimeout(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
