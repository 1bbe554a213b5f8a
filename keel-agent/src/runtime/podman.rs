//! Podman container runtime
//!
//! Drives the podman CLI for step containers:
//! - Creating a container per step with its mounts, devices and environment
//! - Starting it and waiting for exit
//! - Reading its timestamped output
//! - Stopping and force-removing it

use anyhow::Context;
use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};

/// Seconds podman waits after SIGTERM before killing a stopped container
const STOP_TIMEOUT_SECS: u32 = 10;

/// Checks if podman is installed and available
pub async fn check_podman_available() -> anyhow::Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs one podman subcommand, failing on a non-zero exit
    async fn run(&self, op: &'static str, args: &[String]) -> Result<Output, RuntimeError> {
        let output = Command::new(&self.binary).args(args).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Always log stdout/stderr as debug
        if !stdout.trim().is_empty() {
            debug!("podman {} stdout: {}", op, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("podman {} stderr: {}", op, stderr.trim());
        }

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                op,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// Arguments of `podman create` for `spec`
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

    if let Some(hostname) = &spec.hostname {
        args.push("--hostname".to_string());
        args.push(hostname.clone());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    let repeated = [
        ("-v", &spec.volumes),
        ("--tmpfs", &spec.tmpfs),
        ("-p", &spec.ports),
        ("--device", &spec.devices),
        ("--cap-add", &spec.cap_add),
        ("--security-opt", &spec.security_opt),
    ];
    for (flag, values) in repeated {
        for value in values {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }

    if spec.gpu {
        args.push("--device".to_string());
        args.push("nvidia.com/gpu=all".to_string());
    }

    args.push(spec.image.clone());

    if let Some(script) = &spec.script {
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(script.clone());
    }

    args
}

/// Tags podman's two output pipes so both parse with the same line format.
///
/// Lines are `"<timestamp> <content>"`; the source is inserted after the
/// timestamp. Lines without a space are passed through untouched.
fn tag_lines(output: &[u8], source: &str) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(' ') {
            Some((ts, rest)) => format!("{} {} {}", ts, source, rest),
            None => line.to_string(),
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        info!("Creating container {} from {}", spec.name, spec.image);
        let output = self.run("create", &create_args(spec)).await?;

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::UnexpectedOutput(
                "podman create printed no container ID".to_string(),
            ));
        }

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.run("start", &["start".to_string(), handle.id.clone()])
            .await?;
        Ok(())
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let output = self
            .run("wait", &["wait".to_string(), handle.id.clone()])
            .await?;

        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse()
            .map_err(|_| RuntimeError::UnexpectedOutput(format!("exit code {:?}", text.trim())))
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .run(
                "logs",
                &[
                    "logs".to_string(),
                    "--timestamps".to_string(),
                    handle.id.clone(),
                ],
            )
            .await?;

        let mut lines = tag_lines(&output.stdout, "stdout");
        lines.extend(tag_lines(&output.stderr, "stderr"));
        Ok(lines)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        info!("Stopping container {}", handle.name);
        self.run(
            "stop",
            &[
                "stop".to_string(),
                "-t".to_string(),
                STOP_TIMEOUT_SECS.to_string(),
                handle.id.clone(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        debug!("Removing container {}", handle.name);
        self.run(
            "rm",
            &["rm".to_string(), "-f".to_string(), handle.id.clone()],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_create_args_map_every_option() {
        let spec = ContainerSpec {
            name: "keel-e1-build".to_string(),
            image: "alpine:3".to_string(),
            hostname: Some("builder".to_string()),
            privileged: true,
            env: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
            ]),
            volumes: vec!["/data:/data:ro".to_string()],
            tmpfs: vec!["/tmp".to_string()],
            ports: vec!["8080:80".to_string()],
            devices: vec!["/dev/fuse".to_string()],
            cap_add: vec!["SYS_ADMIN".to_string()],
            security_opt: vec!["label=disable".to_string()],
            gpu: true,
            script: Some("cd /src && make".to_string()),
        };

        let args = create_args(&spec);
        let expected: Vec<String> = [
            "create", "--name", "keel-e1-build",
            "--hostname", "builder",
            "--privileged",
            "-e", "A=1",
            "-e", "B=two words",
            "-v", "/data:/data:ro",
            "--tmpfs", "/tmp",
            "-p", "8080:80",
            "--device", "/dev/fuse",
            "--cap-add", "SYS_ADMIN",
            "--security-opt", "label=disable",
            "--device", "nvidia.com/gpu=all",
            "alpine:3",
            "sh", "-c", "cd /src && make",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_create_args_without_script_keep_image_command() {
        let spec = ContainerSpec {
            name: "keel-e1-run".to_string(),
            image: "nginx".to_string(),
            ..Default::default()
        };
        assert_eq!(
            create_args(&spec),
            vec!["create", "--name", "keel-e1-run", "nginx"]
        );
    }

    #[test]
    fn test_tag_lines() {
        let lines = tag_lines(
            b"2024-05-01T10:00:00Z oops\n\nnot-a-line\n",
            "stderr",
        );
        assert_eq!(lines, vec!["2024-05-01T10:00:00Z stderr oops", "not-a-line"]);
    }
}
