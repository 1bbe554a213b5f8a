//! Keel Core
//!
//! Core types and abstractions for the Keel fleet dispatch system.
//!
//! This crate contains:
//! - Domain types: pipelines, steps, nodes and log entries, including the
//!   pipeline/step lifecycle state machine
//! - DTOs: request/response bodies for every RPC and the stream protocol frames
//! - Event bus: bounded, non-blocking publish/subscribe-by-kind
//! - Retry: exponential backoff with jitter for calls that cross the network
//! - Transport: the `NodeStream` abstraction over the long-lived node stream

pub mod domain;
pub mod dto;
pub mod event;
pub mod retry;
pub mod transport;
