//! Data Transfer Objects for inter-service communication
//!
//! Request and response bodies exchanged between the dispatch server, agents
//! and clients. The `stream` module holds the frames carried by the long-lived
//! node stream; everything else travels over unary JSON calls.

pub mod log;
pub mod node;
pub mod pipeline;
pub mod stream;

use serde::{Deserialize, Serialize};

/// Generic acknowledgement returned by fire-and-forget RPCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: bool,
}

impl Ack {
    pub fn yes() -> Self {
        Self { ack: true }
    }

    pub fn no() -> Self {
        Self { ack: false }
    }
}
