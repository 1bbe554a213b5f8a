//! Core domain types
//!
//! This module contains the core domain structures used across Keel services.
//! Pipelines are owned by the agent executing them and mirrored read-only by the
//! dispatch server; nodes are owned by the dispatch server's catalog.

pub mod log;
pub mod node;
pub mod pipeline;
