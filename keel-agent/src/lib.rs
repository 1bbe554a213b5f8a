//! Keel Agent
//!
//! Runs on every node of the fleet: registers with the dispatch server, holds
//! one node stream open and executes the pipelines assigned over it.
//!
//! Architecture:
//! - `coordinator`: registration, the stream loop, assignment and cancel
//!   handling
//! - `connection`: HTTP client and stream dialing behind the retry policy
//! - `engine`: sequential step execution and the pipeline state machine
//! - `runtime`: container runtime trait and its podman implementation
//! - `reporter`: mirrors engine events to the dispatch server

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod engine;
pub mod reporter;
pub mod runtime;

pub use config::Config;
pub use coordinator::Coordinator;
