//! Shared application state

use std::sync::Arc;

use keel_core::event::{EventBus, FleetEvent};

use crate::config::Config;
use crate::dispatch::{DispatchConfig, DispatchServer};
use crate::repository::log::LogStore;
use crate::repository::node::{InMemoryNodeCatalog, NodeCatalog};
use crate::repository::pipeline::{InMemoryPipelineCatalog, PipelineCatalog};

/// Handles shared by the HTTP API, the stream listener and background tasks
#[derive(Clone)]
pub struct AppState {
    pub nodes: Arc<dyn NodeCatalog>,
    pub pipelines: Arc<dyn PipelineCatalog>,
    pub logs: Arc<LogStore>,
    pub dispatch: Arc<DispatchServer>,
    pub events: Arc<EventBus<FleetEvent>>,
}

impl AppState {
    /// State backed by the in-memory catalogs
    pub fn in_memory(config: &Config) -> Self {
        let events = Arc::new(EventBus::new(config.event_queue));
        let dispatch = Arc::new(DispatchServer::new(
            DispatchConfig {
                heartbeat_period: config.heartbeat_period,
                max_pipelines_per_node: config.max_pipelines_per_node,
            },
            events.clone(),
        ));

        Self {
            nodes: Arc::new(InMemoryNodeCatalog::new()),
            pipelines: Arc::new(InMemoryPipelineCatalog::new()),
            logs: Arc::new(LogStore::new(config.log_retention)),
            dispatch,
            events,
        }
    }
}
