//! Pipeline domain types
//!
//! A pipeline is an ordered list of container steps plus a status block.
//! The status block is mutated only through the state machine methods on
//! [`Pipeline`], which enforce the lifecycle:
//!
//! ```text
//! pipeline: pending -> running -> {completed | failed | canceled}
//! step:     pending -> running -> {completed | failed}
//!           pending -> skipped
//! ```
//!
//! Repeating the current state is accepted as a no-op so status syncs stay idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Failed | PipelineState::Canceled
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;

        self == next
            || matches!(
                (self, next),
                (Pending, Running)
                    | (Pending, Failed)
                    | (Pending, Canceled)
                    | (Running, Completed)
                    | (Running, Failed)
                    | (Running, Canceled)
            )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Pending => "pending",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
            PipelineState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Step lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;

        self == next
            || matches!(
                (self, next),
                (Pending, Running) | (Pending, Skipped) | (Running, Completed) | (Running, Failed)
            )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Errors raised by the pipeline state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("step index {index} out of range (total steps: {total})")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("invalid pipeline transition {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("invalid transition for step '{step}': {from} -> {to}")]
    InvalidStepTransition {
        step: String,
        from: StepState,
        to: StepState,
    },
}

/// Step type discriminator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Container,
}

/// Device reservation, e.g. `capabilities: ["gpu"]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReservation {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub reservations: Vec<DeviceReservation>,
}

/// Container configuration for a single step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub tmpfs: Vec<String>,
    #[serde(default)]
    pub devices: Vec<String>,
    /// Mounts in `host:container[:ro]` form
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Shell commands, joined with `&&` at execution time
    #[serde(default)]
    pub commands: Vec<String>,
}

/// One step of a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Unique within its pipeline, doubles as the step ID
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: StepKind,
    pub container: ContainerConfig,
}

/// Declarative pipeline definition, as submitted by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub envs: HashMap<String, String>,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl PipelineDefinition {
    /// Checks structural validity: a name, and unique, non-empty step names
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("pipeline name cannot be empty".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err("step name cannot be empty".to_string());
            }
            if !seen.insert(step.name.as_str()) {
                return Err(format!("duplicate step name '{}'", step.name));
            }
            if step.container.image.trim().is_empty() {
                return Err(format!("step '{}' has no container image", step.name));
            }
        }

        Ok(())
    }
}

/// Status of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: String,
    pub name: String,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepStatus {
    fn pending(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            state: StepState::Pending,
            container_id: None,
            start_time: None,
            end_time: None,
            error: None,
            output: None,
            updated_at: Utc::now(),
        }
    }
}

/// Status of a whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub node_id: Option<String>,
    pub state: PipelineState,
    pub current_step: usize,
    pub total_steps: usize,
    pub progress: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub steps: Vec<StepStatus>,
    pub updated_at: DateTime<Utc>,
}

/// A pipeline instance: definition plus execution status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    id: String,
    name: String,
    description: Option<String>,
    envs: HashMap<String, String>,
    args: HashMap<String, String>,
    steps: Vec<PipelineStep>,
    status: PipelineStatus,
}

impl Pipeline {
    /// Builds a pipeline with every step pending.
    ///
    /// A pipeline without steps has nothing to run and starts out completed.
    pub fn new(id: impl Into<String>, definition: PipelineDefinition) -> Self {
        let now = Utc::now();
        let total_steps = definition.steps.len();
        let steps_status = definition
            .steps
            .iter()
            .map(|s| StepStatus::pending(&s.name))
            .collect();

        let (state, progress, end_time) = if total_steps == 0 {
            (PipelineState::Completed, 1.0, Some(now))
        } else {
            (PipelineState::Pending, 0.0, None)
        };

        Self {
            id: id.into(),
            name: definition.name,
            description: definition.description,
            envs: definition.envs,
            args: definition.args,
            steps: definition.steps,
            status: PipelineStatus {
                node_id: None,
                state,
                current_step: 0,
                total_steps,
                progress,
                start_time: None,
                end_time,
                error_message: None,
                steps: steps_status,
                updated_at: now,
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn envs(&self) -> &HashMap<String, String> {
        &self.envs
    }

    pub fn args(&self) -> &HashMap<String, String> {
        &self.args
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub fn state(&self) -> PipelineState {
        self.status.state
    }

    pub fn total_steps(&self) -> usize {
        self.status.total_steps
    }

    pub fn progress(&self) -> f64 {
        self.status.progress
    }

    pub fn step_status(&self, index: usize) -> Option<&StepStatus> {
        self.status.steps.get(index)
    }

    /// Position of the step with the given ID (its name)
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.status.steps.iter().position(|s| s.id == step_id)
    }

    /// Rebuilds the definition this pipeline was created from
    pub fn definition(&self) -> PipelineDefinition {
        PipelineDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            envs: self.envs.clone(),
            args: self.args.clone(),
            steps: self.steps.clone(),
        }
    }

    pub fn set_node(&mut self, node_id: impl Into<String>) {
        self.status.node_id = Some(node_id.into());
        self.status.updated_at = Utc::now();
    }

    /// Moves step `index` to `state`.
    ///
    /// Entering `running` stamps the start time, entering a terminal state
    /// stamps the end time. Out-of-range indexes and illegal transitions leave
    /// every step untouched.
    pub fn update_step_state(&mut self, index: usize, state: StepState) -> Result<(), PipelineError> {
        let total = self.status.total_steps;
        let step = self
            .status
            .steps
            .get_mut(index)
            .ok_or(PipelineError::IndexOutOfRange { index, total })?;

        if !step.state.can_transition_to(state) {
            return Err(PipelineError::InvalidStepTransition {
                step: step.name.clone(),
                from: step.state,
                to: state,
            });
        }
        if step.state == state {
            return Ok(());
        }

        let now = Utc::now();
        step.state = state;
        if state == StepState::Running {
            step.start_time = Some(now);
        }
        if state.is_terminal() {
            step.end_time = Some(now);
        }
        step.updated_at = now;
        self.status.updated_at = now;
        Ok(())
    }

    /// Records `index` as the current step and recomputes progress as
    /// `(index + 1) / total_steps`
    pub fn update_progress(&mut self, index: usize) -> Result<(), PipelineError> {
        let total = self.status.total_steps;
        if index >= total {
            return Err(PipelineError::IndexOutOfRange { index, total });
        }

        self.status.current_step = index;
        self.status.progress = (index + 1) as f64 / total as f64;
        self.status.updated_at = Utc::now();
        Ok(())
    }

    /// Attaches error text to a step. Out-of-range indexes are ignored.
    pub fn set_step_error(&mut self, index: usize, error: impl Into<String>) {
        if let Some(step) = self.status.steps.get_mut(index) {
            step.error = Some(error.into());
            step.updated_at = Utc::now();
        }
    }

    /// Attaches captured output to a step. Out-of-range indexes are ignored.
    pub fn set_step_output(&mut self, index: usize, output: impl Into<String>) {
        if let Some(step) = self.status.steps.get_mut(index) {
            step.output = Some(output.into());
            step.updated_at = Utc::now();
        }
    }

    pub fn set_step_container(&mut self, index: usize, container_id: impl Into<String>) {
        if let Some(step) = self.status.steps.get_mut(index) {
            step.container_id = Some(container_id.into());
            step.updated_at = Utc::now();
        }
    }

    /// Moves the pipeline to `state`, stamping start/end times.
    ///
    /// Completing a pipeline also pins progress to 1.0.
    pub fn update_pipeline_state(&mut self, state: PipelineState) -> Result<(), PipelineError> {
        let from = self.status.state;
        if !from.can_transition_to(state) {
            return Err(PipelineError::InvalidTransition { from, to: state });
        }
        if from == state {
            return Ok(());
        }

        let now = Utc::now();
        self.status.state = state;
        if state == PipelineState::Running {
            self.status.start_time = Some(now);
        }
        if state.is_terminal() {
            self.status.end_time = Some(now);
        }
        if state == PipelineState::Completed {
            self.status.progress = 1.0;
        }
        self.status.updated_at = now;
        Ok(())
    }

    /// Sets the pipeline-level error message. Allowed in terminal states.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status.error_message = Some(message.into());
        self.status.updated_at = Utc::now();
    }

    /// Replaces the whole status block with one reported by the executing agent.
    ///
    /// Used by the dispatch server's read-only mirror; `total_steps` and the
    /// step list shape are kept from the local copy.
    pub fn mirror_status(&mut self, mut status: PipelineStatus) {
        status.total_steps = self.status.total_steps;
        if status.steps.len() != self.status.steps.len() {
            status.steps = std::mem::take(&mut self.status.steps);
        }
        self.status = status;
    }

    /// Replaces one step's status with one reported by the executing agent.
    /// Returns false when no step has that ID.
    pub fn mirror_step_status(&mut self, step_id: &str, status: StepStatus) -> bool {
        match self.step_index(step_id) {
            Some(index) => {
                self.status.steps[index] = status;
                self.status.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> PipelineStep {
        PipelineStep {
            name: name.to_string(),
            kind: StepKind::Container,
            container: ContainerConfig {
                image: "docker.io/alpine:latest".to_string(),
                commands: vec!["echo hi".to_string()],
                ..Default::default()
            },
        }
    }

    fn definition(steps: &[&str]) -> PipelineDefinition {
        PipelineDefinition {
            name: "start-platform".to_string(),
            description: None,
            envs: HashMap::new(),
            args: HashMap::new(),
            steps: steps.iter().map(|s| step(s)).collect(),
        }
    }

    #[test]
    fn test_new_pipeline_is_pending() {
        let p = Pipeline::new("exec-1", definition(&["pull", "run", "verify"]));

        assert_eq!(p.state(), PipelineState::Pending);
        assert_eq!(p.total_steps(), 3);
        assert_eq!(p.progress(), 0.0);
        assert!(p.status().steps.iter().all(|s| s.state == StepState::Pending));
        assert_eq!(p.step_status(1).unwrap().id, "run");
    }

    #[test]
    fn test_zero_step_pipeline_is_completed() {
        let p = Pipeline::new("exec-1", definition(&[]));

        assert_eq!(p.state(), PipelineState::Completed);
        assert_eq!(p.progress(), 1.0);
        assert!(p.status().end_time.is_some());
    }

    #[test]
    fn test_step_state_stamps_times() {
        let mut p = Pipeline::new("exec-1", definition(&["a", "b"]));

        p.update_step_state(0, StepState::Running).unwrap();
        let s = p.step_status(0).unwrap();
        assert!(s.start_time.is_some());
        assert!(s.end_time.is_none());

        p.update_step_state(0, StepState::Completed).unwrap();
        assert!(p.step_status(0).unwrap().end_time.is_some());

        p.update_step_state(1, StepState::Skipped).unwrap();
        let s = p.step_status(1).unwrap();
        assert!(s.start_time.is_none());
        assert!(s.end_time.is_some());
    }

    #[test]
    fn test_step_index_out_of_range_leaves_steps_unchanged() {
        let mut p = Pipeline::new("exec-1", definition(&["a", "b"]));
        let before = p.status().steps.clone();

        let err = p.update_step_state(2, StepState::Running).unwrap_err();
        assert_eq!(err, PipelineError::IndexOutOfRange { index: 2, total: 2 });
        assert_eq!(p.status().steps, before);
    }

    #[test]
    fn test_illegal_step_transition_rejected() {
        let mut p = Pipeline::new("exec-1", definition(&["a"]));

        assert!(matches!(
            p.update_step_state(0, StepState::Completed),
            Err(PipelineError::InvalidStepTransition { .. })
        ));
        assert_eq!(p.step_status(0).unwrap().state, StepState::Pending);

        p.update_step_state(0, StepState::Running).unwrap();
        assert!(matches!(
            p.update_step_state(0, StepState::Skipped),
            Err(PipelineError::InvalidStepTransition { .. })
        ));
        assert_eq!(p.step_status(0).unwrap().state, StepState::Running);

        p.update_step_state(0, StepState::Failed).unwrap();
        assert!(p.update_step_state(0, StepState::Running).is_err());
    }

    #[test]
    fn test_repeated_state_is_noop() {
        let mut p = Pipeline::new("exec-1", definition(&["a"]));
        p.update_step_state(0, StepState::Running).unwrap();
        let started = p.step_status(0).unwrap().start_time;

        p.update_step_state(0, StepState::Running).unwrap();
        assert_eq!(p.step_status(0).unwrap().start_time, started);
    }

    #[test]
    fn test_progress() {
        let mut p = Pipeline::new("exec-1", definition(&["a", "b", "c", "d"]));

        p.update_progress(0).unwrap();
        assert_eq!(p.progress(), 0.25);
        p.update_progress(3).unwrap();
        assert_eq!(p.progress(), 1.0);
        assert_eq!(p.status().current_step, 3);

        assert!(p.update_progress(4).is_err());
        assert_eq!(p.status().current_step, 3);
    }

    #[test]
    fn test_diagnostics_ignore_out_of_range() {
        let mut p = Pipeline::new("exec-1", definition(&["a"]));

        p.set_step_error(5, "boom");
        p.set_step_output(5, "output");
        p.set_step_error(0, "exit code 1");
        p.set_step_output(0, "hello");

        let s = p.step_status(0).unwrap();
        assert_eq!(s.error.as_deref(), Some("exit code 1"));
        assert_eq!(s.output.as_deref(), Some("hello"));
        assert_eq!(s.state, StepState::Pending);
    }

    #[test]
    fn test_pipeline_transitions() {
        let mut p = Pipeline::new("exec-1", definition(&["a"]));

        p.update_pipeline_state(PipelineState::Running).unwrap();
        assert!(p.status().start_time.is_some());

        p.update_pipeline_state(PipelineState::Completed).unwrap();
        assert_eq!(p.progress(), 1.0);
        assert!(p.status().end_time.is_some());

        let err = p.update_pipeline_state(PipelineState::Running).unwrap_err();
        assert_eq!(
            err,
            PipelineError::InvalidTransition {
                from: PipelineState::Completed,
                to: PipelineState::Running
            }
        );

        // terminal states still accept error text
        p.set_error("late diagnostic");
        assert_eq!(p.status().error_message.as_deref(), Some("late diagnostic"));
    }

    #[test]
    fn test_definition_validation() {
        assert!(definition(&["a", "b"]).validate().is_ok());
        assert!(definition(&["a", "a"]).validate().is_err());

        let mut def = definition(&["a"]);
        def.name = " ".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let json = r#"{
            "name": "start-platform",
            "steps": [
                {"name": "run", "type": "container", "container": {"image": "alpine", "commands": ["true"]}}
            ]
        }"#;

        let def: PipelineDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].kind, StepKind::Container);
        assert!(!def.steps[0].container.privileged);
        assert!(def.envs.is_empty());
    }

    #[test]
    fn test_mirror_step_status() {
        let mut agent_side = Pipeline::new("exec-1", definition(&["a", "b"]));
        let mut server_side = agent_side.clone();

        agent_side.update_step_state(1, StepState::Skipped).unwrap();
        let reported = agent_side.step_status(1).unwrap().clone();

        assert!(server_side.mirror_step_status("b", reported));
        assert_eq!(server_side.step_status(1).unwrap().state, StepState::Skipped);
        assert!(!server_side.mirror_step_status("missing", agent_side.step_status(0).unwrap().clone()));
    }
}
