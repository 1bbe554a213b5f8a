//! Status reporter
//!
//! Mirrors one execution's engine events to the dispatch server. Step logs are
//! held back and sent with the next step status update.

use std::sync::Arc;
use tracing::{debug, warn};

use keel_core::domain::log::LogEntry;
use keel_core::event::{BusEvent, Subscription};

use crate::connection::ConnectionManager;
use crate::engine::EngineEvent;

pub struct Reporter {
    connection: Arc<ConnectionManager>,
}

impl Reporter {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Forwards events until the execution's terminal event or until the
    /// engine's bus is gone
    pub async fn run(self, mut events: Subscription<EngineEvent>) {
        let mut pending_logs: Vec<LogEntry> = Vec::new();

        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            self.forward(event, &mut pending_logs).await;
            if terminal {
                break;
            }
        }
    }

    async fn forward(&self, event: EngineEvent, pending_logs: &mut Vec<LogEntry>) {
        let result = match &event {
            EngineEvent::StepLog { entries, .. } => {
                pending_logs.extend(entries.iter().cloned());
                return;
            }
            EngineEvent::StepStarted { execution_id, step }
            | EngineEvent::StepCompleted { execution_id, step }
            | EngineEvent::StepFailed {
                execution_id, step, ..
            } => {
                let logs = std::mem::take(pending_logs);
                self.connection
                    .update_step_status(execution_id, step, &logs)
                    .await
            }
            EngineEvent::PipelineStarted {
                execution_id,
                status,
            }
            | EngineEvent::PipelineCompleted {
                execution_id,
                status,
            }
            | EngineEvent::PipelineFailed {
                execution_id,
                status,
                ..
            }
            | EngineEvent::PipelineCanceled {
                execution_id,
                status,
                ..
            } => {
                self.connection
                    .update_pipeline_status(execution_id, status)
                    .await
            }
        };

        let kind = event.kind();
        let execution_id = event.execution_id();
        match result {
            Ok(ack) if ack.ack => debug!("Reported {:?} of {}", kind, execution_id),
            Ok(_) => warn!("Server did not accept {:?} of {}", kind, execution_id),
            Err(e) => warn!("Failed to report {:?} of {}: {}", kind, execution_id, e),
        }
    }
}
