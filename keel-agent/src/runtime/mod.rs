//! Container runtime
//!
//! The engine drives steps through the [`ContainerRuntime`] trait; the
//! production implementation shells out to podman.

pub mod podman;

pub use podman::PodmanRuntime;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use keel_core::domain::pipeline::PipelineStep;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to spawn runtime command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{op} failed with exit code {code}: {stderr}")]
    CommandFailed {
        op: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("unexpected runtime output: {0}")]
    UnexpectedOutput(String),
}

/// Opaque handle to a created container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Everything needed to create the container of one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub privileged: bool,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub tmpfs: Vec<String>,
    pub ports: Vec<String>,
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    /// Expose all GPUs of the host
    pub gpu: bool,
    /// Shell script run with `sh -c`; `None` keeps the image's command
    pub script: Option<String>,
}

impl ContainerSpec {
    /// Builds the container of `step`, overlaying the step environment on the
    /// pipeline environment
    pub fn for_step(
        execution_id: &str,
        step: &PipelineStep,
        pipeline_envs: &HashMap<String, String>,
    ) -> Self {
        let container = &step.container;

        let mut env: BTreeMap<String, String> = pipeline_envs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(
            container
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let gpu = container
            .deploy
            .reservations
            .iter()
            .any(|r| r.capabilities.iter().any(|c| c == "gpu"));

        Self {
            name: container_name(execution_id, &step.name),
            image: container.image.clone(),
            hostname: container.hostname.clone(),
            privileged: container.privileged,
            env,
            volumes: container.volumes.clone(),
            tmpfs: container.tmpfs.clone(),
            ports: container.ports.clone(),
            devices: container.devices.clone(),
            cap_add: container.cap_add.clone(),
            security_opt: container.security_opt.clone(),
            gpu,
            script: join_commands(&container.commands),
        }
    }
}

/// `keel-{execution}-{step}`, restricted to characters podman accepts
pub fn container_name(execution_id: &str, step_name: &str) -> String {
    let raw = format!("keel-{}-{}", execution_id, step_name);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Joins step commands into one `&&` chain; `None` when there are none
pub fn join_commands(commands: &[String]) -> Option<String> {
    let commands: Vec<&str> = commands
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();

    match commands.as_slice() {
        [] => None,
        [single] => Some(single.to_string()),
        many => Some(many.join(" && ")),
    }
}

/// Lifecycle primitives of a container engine, keyed by [`ContainerHandle`]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Blocks until the container exits and returns its exit code
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Timestamped output lines, each `"<RFC3339> <stdout|stderr> <content>"`
    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<String>, RuntimeError>;

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
