//! Pipeline engine
//!
//! Runs the steps of one pipeline in declared order, one container per step,
//! and drives the pipeline state machine as it goes. Each transition is
//! announced on an [`EventBus`] so it can be mirrored to the dispatch server.
//!
//! Steps never overlap: a later step may depend on what an earlier container
//! left behind.

mod event;

pub use event::{EngineEvent, EngineEventKind};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::domain::log::LogEntry;
use keel_core::domain::pipeline::{
    Pipeline, PipelineError, PipelineState, PipelineStep, StepState, StepStatus,
};
use keel_core::event::EventBus;

use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};

/// A pipeline shared between its engine and status readers
pub type SharedPipeline = Arc<Mutex<Pipeline>>;

const DEFAULT_CANCEL_REASON: &str = "canceled";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("pipeline canceled: {0}")]
    Canceled(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Why a single step stopped
enum StepError {
    Failed {
        message: String,
        output: Option<String>,
    },
    Canceled,
}

impl StepError {
    fn failed(message: impl Into<String>) -> Self {
        StepError::Failed {
            message: message.into(),
            output: None,
        }
    }
}

pub struct PipelineEngine {
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<EventBus<EngineEvent>>,
    token: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
}

impl PipelineEngine {
    /// Cancelling `parent` cancels this engine too
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<EventBus<EngineEvent>>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            runtime,
            events,
            token: parent.child_token(),
            cancel_reason: Mutex::new(None),
        }
    }

    /// Stops the in-flight step and makes `execute` finish as canceled.
    ///
    /// The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self
                .cancel_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> String {
        self.cancel_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string())
    }

    /// Runs every step of `pipeline` until one fails or the engine is
    /// canceled
    pub async fn execute(&self, pipeline: &SharedPipeline) -> Result<(), EngineError> {
        let (execution_id, steps, envs) = with_pipeline(pipeline, |p| {
            (p.id().to_string(), p.steps().to_vec(), p.envs().clone())
        });

        // nothing to run; complete since construction
        if steps.is_empty() {
            let status = with_pipeline(pipeline, |p| p.status().clone());
            self.publish(EngineEvent::PipelineCompleted {
                execution_id,
                status,
            });
            return Ok(());
        }

        if self.token.is_cancelled() {
            return self.finish_canceled(pipeline, &execution_id, None);
        }

        let status = with_pipeline(pipeline, |p| {
            p.update_pipeline_state(PipelineState::Running)?;
            Ok::<_, PipelineError>(p.status().clone())
        })?;
        info!("Executing pipeline {} ({} steps)", execution_id, steps.len());
        self.publish(EngineEvent::PipelineStarted {
            execution_id: execution_id.clone(),
            status,
        });

        for (index, step) in steps.iter().enumerate() {
            if self.token.is_cancelled() {
                return self.finish_canceled(pipeline, &execution_id, None);
            }

            let started = with_pipeline(pipeline, |p| {
                p.update_step_state(index, StepState::Running)?;
                p.update_progress(index)?;
                Ok::<_, PipelineError>(step_snapshot(p, index))
            })?;
            debug!("Step {} of {} started", step.name, execution_id);
            self.publish(EngineEvent::StepStarted {
                execution_id: execution_id.clone(),
                step: started,
            });

            match self.run_step(pipeline, &execution_id, index, step, &envs).await {
                Ok(output) => {
                    let completed = with_pipeline(pipeline, |p| {
                        p.set_step_output(index, output);
                        p.update_step_state(index, StepState::Completed)?;
                        Ok::<_, PipelineError>(step_snapshot(p, index))
                    })?;
                    self.publish(EngineEvent::StepCompleted {
                        execution_id: execution_id.clone(),
                        step: completed,
                    });
                }
                Err(StepError::Canceled) => {
                    return self.finish_canceled(pipeline, &execution_id, Some(index));
                }
                Err(StepError::Failed { message, output }) => {
                    return self.finish_failed(pipeline, &execution_id, index, message, output);
                }
            }
        }

        let status = with_pipeline(pipeline, |p| {
            p.update_pipeline_state(PipelineState::Completed)?;
            Ok::<_, PipelineError>(p.status().clone())
        })?;
        info!("Pipeline {} completed", execution_id);
        self.publish(EngineEvent::PipelineCompleted {
            execution_id,
            status,
        });
        Ok(())
    }

    /// Create, run and always remove the container of one step
    async fn run_step(
        &self,
        pipeline: &SharedPipeline,
        execution_id: &str,
        index: usize,
        step: &PipelineStep,
        envs: &HashMap<String, String>,
    ) -> Result<String, StepError> {
        let spec = ContainerSpec::for_step(execution_id, step, envs);
        let handle = self
            .runtime
            .create(&spec)
            .await
            .map_err(|e| StepError::failed(format!("create container: {}", e)))?;
        with_pipeline(pipeline, |p| p.set_step_container(index, handle.id.clone()));

        let result = self.run_container(execution_id, &step.name, &handle).await;

        if let Err(e) = self.runtime.remove(&handle).await {
            warn!("Failed to remove container {}: {}", handle.name, e);
        }
        result
    }

    async fn run_container(
        &self,
        execution_id: &str,
        step_id: &str,
        handle: &ContainerHandle,
    ) -> Result<String, StepError> {
        if self.token.is_cancelled() {
            return Err(StepError::Canceled);
        }

        self.runtime
            .start(handle)
            .await
            .map_err(|e| StepError::failed(format!("start container: {}", e)))?;

        let exit_code = tokio::select! {
            _ = self.token.cancelled() => {
                if let Err(e) = self.runtime.stop(handle).await {
                    warn!("Failed to stop container {}: {}", handle.name, e);
                }
                return Err(StepError::Canceled);
            }
            code = self.runtime.wait(handle) => {
                code.map_err(|e| StepError::failed(format!("wait for container: {}", e)))?
            }
        };

        let output = self.collect_logs(execution_id, step_id, handle).await;

        if exit_code != 0 {
            return Err(StepError::Failed {
                message: format!("container exited with code {}", exit_code),
                output: Some(output),
            });
        }
        Ok(output)
    }

    /// Publishes the container's output and returns it as one text block.
    /// Unreadable logs are not a step failure.
    async fn collect_logs(
        &self,
        execution_id: &str,
        step_id: &str,
        handle: &ContainerHandle,
    ) -> String {
        let lines = match self.runtime.logs(handle).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Failed to read logs of {}: {}", handle.name, e);
                return String::new();
            }
        };

        let mut entries: Vec<LogEntry> = lines.iter().map(|l| LogEntry::parse_line(l)).collect();
        entries.sort_by_key(|e| e.timestamp);

        let output = entries
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        if !entries.is_empty() {
            self.publish(EngineEvent::StepLog {
                execution_id: execution_id.to_string(),
                step_id: step_id.to_string(),
                entries,
            });
        }
        output
    }

    fn finish_failed(
        &self,
        pipeline: &SharedPipeline,
        execution_id: &str,
        index: usize,
        message: String,
        output: Option<String>,
    ) -> Result<(), EngineError> {
        let (step, status) = with_pipeline(pipeline, |p| {
            if let Some(output) = output {
                p.set_step_output(index, output);
            }
            p.set_step_error(index, message.clone());
            p.update_step_state(index, StepState::Failed)?;
            p.update_pipeline_state(PipelineState::Failed)?;
            p.set_error(message.clone());
            Ok::<_, PipelineError>((step_snapshot(p, index), p.status().clone()))
        })?;

        warn!("Pipeline {} failed at step {}: {}", execution_id, step.name, message);
        let step_name = step.name.clone();
        self.publish(EngineEvent::StepFailed {
            execution_id: execution_id.to_string(),
            step,
            error: message.clone(),
        });
        self.publish(EngineEvent::PipelineFailed {
            execution_id: execution_id.to_string(),
            status,
            error: message.clone(),
        });

        Err(EngineError::StepFailed {
            step: step_name,
            message,
        })
    }

    /// `index` is the step that was interrupted, if any
    fn finish_canceled(
        &self,
        pipeline: &SharedPipeline,
        execution_id: &str,
        index: Option<usize>,
    ) -> Result<(), EngineError> {
        let reason = self.reason();

        let (step, status) = with_pipeline(pipeline, |p| {
            let step = match index {
                Some(index) => {
                    p.set_step_error(index, format!("canceled: {}", reason));
                    p.update_step_state(index, StepState::Failed)?;
                    Some(step_snapshot(p, index))
                }
                None => None,
            };
            p.update_pipeline_state(PipelineState::Canceled)?;
            p.set_error(reason.clone());
            Ok::<_, PipelineError>((step, p.status().clone()))
        })?;

        info!("Pipeline {} canceled: {}", execution_id, reason);
        if let Some(step) = step {
            self.publish(EngineEvent::StepFailed {
                execution_id: execution_id.to_string(),
                step,
                error: format!("canceled: {}", reason),
            });
        }
        self.publish(EngineEvent::PipelineCanceled {
            execution_id: execution_id.to_string(),
            status,
            reason: reason.clone(),
        });

        Err(EngineError::Canceled(reason))
    }

    fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }
}

fn with_pipeline<R>(pipeline: &SharedPipeline, f: impl FnOnce(&mut Pipeline) -> R) -> R {
    let mut guard = pipeline.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

fn step_snapshot(pipeline: &Pipeline, index: usize) -> StepStatus {
    // index comes from iterating the pipeline's own steps
    pipeline.status().steps[index].clone()
}
