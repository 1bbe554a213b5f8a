//! Engine lifecycle events
//!
//! Every event carries a snapshot of the status it announces, so consumers can
//! mirror it without touching the pipeline lock.

use keel_core::domain::log::LogEntry;
use keel_core::domain::pipeline::{PipelineStatus, StepStatus};
use keel_core::event::BusEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEventKind {
    PipelineStarted,
    StepStarted,
    StepLog,
    StepCompleted,
    StepFailed,
    PipelineCompleted,
    PipelineFailed,
    PipelineCanceled,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PipelineStarted {
        execution_id: String,
        status: PipelineStatus,
    },
    StepStarted {
        execution_id: String,
        step: StepStatus,
    },
    /// Output of one step, in timestamp order
    StepLog {
        execution_id: String,
        step_id: String,
        entries: Vec<LogEntry>,
    },
    StepCompleted {
        execution_id: String,
        step: StepStatus,
    },
    StepFailed {
        execution_id: String,
        step: StepStatus,
        error: String,
    },
    PipelineCompleted {
        execution_id: String,
        status: PipelineStatus,
    },
    PipelineFailed {
        execution_id: String,
        status: PipelineStatus,
        error: String,
    },
    PipelineCanceled {
        execution_id: String,
        status: PipelineStatus,
        reason: String,
    },
}

impl EngineEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            EngineEvent::PipelineStarted { execution_id, .. }
            | EngineEvent::StepStarted { execution_id, .. }
            | EngineEvent::StepLog { execution_id, .. }
            | EngineEvent::StepCompleted { execution_id, .. }
            | EngineEvent::StepFailed { execution_id, .. }
            | EngineEvent::PipelineCompleted { execution_id, .. }
            | EngineEvent::PipelineFailed { execution_id, .. }
            | EngineEvent::PipelineCanceled { execution_id, .. } => execution_id,
        }
    }

    /// True for the last event of an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            EngineEventKind::PipelineCompleted
                | EngineEventKind::PipelineFailed
                | EngineEventKind::PipelineCanceled
        )
    }
}

impl BusEvent for EngineEvent {
    type Kind = EngineEventKind;

    fn kind(&self) -> EngineEventKind {
        match self {
            EngineEvent::PipelineStarted { .. } => EngineEventKind::PipelineStarted,
            EngineEvent::StepStarted { .. } => EngineEventKind::StepStarted,
            EngineEvent::StepLog { .. } => EngineEventKind::StepLog,
            EngineEvent::StepCompleted { .. } => EngineEventKind::StepCompleted,
            EngineEvent::StepFailed { .. } => EngineEventKind::StepFailed,
            EngineEvent::PipelineCompleted { .. } => EngineEventKind::PipelineCompleted,
            EngineEvent::PipelineFailed { .. } => EngineEventKind::PipelineFailed,
            EngineEvent::PipelineCanceled { .. } => EngineEventKind::PipelineCanceled,
        }
    }
}
