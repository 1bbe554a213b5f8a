//! Keel Dispatch Server
//!
//! Assigns pipelines to nodes over one long-lived stream per node and mirrors
//! their execution status.
//!
//! Architecture:
//! - `dispatch`: node sessions, the session registry, per-node stream handling
//!   and the liveness sweep
//! - `api`: HTTP handlers for the unary RPCs
//! - `service`: business logic between the API, the catalogs and dispatch
//! - `repository`: node and pipeline catalogs plus the log store

pub mod api;
pub mod config;
pub mod dispatch;
pub mod repository;
pub mod service;
pub mod state;

pub use config::Config;
pub use state::AppState;
