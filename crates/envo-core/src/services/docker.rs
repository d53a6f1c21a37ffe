use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::models::{ImageHandle, ImageRef, NetworkSpec, ProbeKind, ProcessHandle, VolumeSpec};
use crate::services::ports;
use crate::services::runtime::{
    ContainerRuntime, HealthProbe, ImageProvider, LaunchSpec, FINGERPRINT_LABEL, PROJECT_LABEL,
    SERVICE_LABEL,
};

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
}

struct CommandOutput {
    success: bool,
    code: i32,
    stdout: String,
    stderr: String,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::with_program("docker")
    }

    /// Use another docker-compatible CLI (e.g. `podman`).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<CommandOutput> {
        tracing::debug!(program = %self.program, args = ?args, "running");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::Runtime(format!("failed to run {}: {e}", self.program))
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;
        if !output.success {
            return Err(OrchestratorError::Runtime(format!(
                "{} {} failed (exit {}): {}",
                self.program,
                args.join(" "),
                output.code,
                output.stderr
            )));
        }
        Ok(output.stdout)
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>> {
        let output = self
            .exec(&["image", "inspect", "--format", "{{.Id}}", reference])
            .await?;
        Ok(output.success.then_some(output.stdout))
    }

    /// `docker logs` for one container, ready to spawn.
    pub fn logs_command(&self, container: &str, follow: bool, tail: Option<usize>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("logs");
        if follow {
            cmd.arg("--follow");
        }
        if let Some(n) = tail {
            cmd.args(["--tail", &n.to_string()]);
        }
        cmd.arg(container);
        cmd
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for `docker run` of one service.
/// `docker stop -t` takes whole seconds; round up so a short grace period is not a kill.
fn stop_timeout(grace: Duration) -> String {
    (grace.as_secs_f64().ceil() as u64).to_string()
}

pub fn run_args(launch: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        launch.container_name.clone(),
        "--label".into(),
        format!("{PROJECT_LABEL}={}", launch.project),
        "--label".into(),
        format!("{SERVICE_LABEL}={}", launch.service),
        "--label".into(),
        format!("{FINGERPRINT_LABEL}={}", launch.fingerprint),
    ];

    if let Some(network) = launch.networks.first() {
        args.extend([
            "--network".into(),
            network.clone(),
            "--network-alias".into(),
            launch.service.clone(),
        ]);
    }
    for (key, value) in &launch.environment {
        args.extend(["-e".into(), format!("{key}={value}")]);
    }
    for port in &launch.ports {
        args.extend(["-p".into(), port.to_string()]);
    }
    for mount in &launch.mounts {
        let mut spec = format!("{}:{}", mount.source, mount.target);
        if mount.read_only {
            spec.push_str(":ro");
        }
        args.extend(["-v".into(), spec]);
    }
    if let Some(cpu) = launch.cpu_limit {
        args.extend(["--cpus".into(), cpu.as_cores().to_string()]);
    }
    if let Some(memory) = launch.memory_limit {
        args.extend(["--memory".into(), memory.bytes().to_string()]);
    }
    if let Some(memory) = launch.memory_reservation {
        args.extend(["--memory-reservation".into(), memory.bytes().to_string()]);
    }
    if let Some(dir) = &launch.working_dir {
        args.extend(["-w".into(), dir.clone()]);
    }

    args.push(launch.image.reference.clone());
    if let Some(command) = &launch.command {
        args.extend(command.iter().cloned());
    }
    args
}

/// Malformed references never succeed; everything else may be transient.
fn classify_pull_error(reference: &str, stderr: &str) -> OrchestratorError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("invalid reference format") || lowered.contains("must be lowercase") {
        OrchestratorError::ImageInvalid {
            image: reference.to_string(),
            reason: stderr.to_string(),
        }
    } else {
        OrchestratorError::ImageUnavailable {
            image: reference.to_string(),
            reason: stderr.to_string(),
        }
    }
}

fn is_missing(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("no such") || lowered.contains("not found")
}

#[async_trait]
impl ImageProvider for DockerBackend {
    async fn fetch_image(&self, reference: &ImageRef) -> Result<ImageHandle> {
        let reference = reference.to_string();
        if let Some(id) = self.image_id(&reference).await? {
            tracing::debug!(image = %reference, "image present locally");
            return Ok(ImageHandle { reference, id });
        }

        tracing::info!(image = %reference, "pulling image");
        let pull = self.exec(&["pull", &reference]).await?;
        if !pull.success {
            return Err(classify_pull_error(&reference, &pull.stderr));
        }
        let id = self
            .image_id(&reference)
            .await?
            .ok_or_else(|| OrchestratorError::ImageUnavailable {
                image: reference.clone(),
                reason: "pulled image is not inspectable".into(),
            })?;
        Ok(ImageHandle { reference, id })
    }
}

#[async_trait]
impl ContainerRuntime for DockerBackend {
    async fn ensure_network(&self, network: &NetworkSpec, runtime_name: &str) -> Result<bool> {
        if self.exec(&["network", "inspect", runtime_name]).await?.success {
            return Ok(false);
        }
        self.run(&["network", "create", "--driver", &network.driver, runtime_name])
            .await?;
        Ok(true)
    }

    async fn remove_network(&self, runtime_name: &str) -> Result<()> {
        let output = self.exec(&["network", "rm", runtime_name]).await?;
        if output.success || is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(OrchestratorError::Runtime(format!(
                "failed to remove network {runtime_name}: {}",
                output.stderr
            )))
        }
    }

    async fn ensure_volume(&self, volume: &VolumeSpec, runtime_name: &str) -> Result<bool> {
        if self.exec(&["volume", "inspect", runtime_name]).await?.success {
            return Ok(false);
        }
        self.run(&["volume", "create", "--driver", &volume.driver, runtime_name])
            .await?;
        Ok(true)
    }

    async fn remove_volume(&self, runtime_name: &str) -> Result<()> {
        let output = self.exec(&["volume", "rm", runtime_name]).await?;
        if output.success || is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(OrchestratorError::Runtime(format!(
                "failed to remove volume {runtime_name}: {}",
                output.stderr
            )))
        }
    }

    async fn start_process(&self, launch: &LaunchSpec) -> Result<ProcessHandle> {
        let start_failed = |reason: String| OrchestratorError::StartFailed {
            service: launch.service.clone(),
            reason,
        };

        ports::ensure_host_ports_free(&launch.service, &launch.ports)?;

        // A leftover container with the same name would make `docker run` fail.
        let _ = self.exec(&["rm", "-f", &launch.container_name]).await;

        let args = run_args(launch);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args).await?;
        if !output.success {
            return Err(start_failed(output.stderr));
        }
        let process = ProcessHandle {
            id: output.stdout,
            name: launch.container_name.clone(),
        };

        for network in launch.networks.iter().skip(1) {
            let connect = self
                .exec(&[
                    "network",
                    "connect",
                    "--alias",
                    &launch.service,
                    network,
                    &process.name,
                ])
                .await?;
            if !connect.success {
                let _ = self.exec(&["rm", "-f", &process.name]).await;
                return Err(start_failed(format!(
                    "could not join network {network}: {}",
                    connect.stderr
                )));
            }
        }

        Ok(process)
    }

    async fn stop_process(&self, process: &ProcessHandle, grace: Duration) -> Result<()> {
        let seconds = stop_timeout(grace);
        let stop = self.exec(&["stop", "-t", &seconds, &process.name]).await?;
        if !stop.success && !is_missing(&stop.stderr) {
            return Err(OrchestratorError::Runtime(format!(
                "failed to stop {}: {}",
                process.name, stop.stderr
            )));
        }
        let remove = self.exec(&["rm", "-f", &process.name]).await?;
        if !remove.success && !is_missing(&remove.stderr) {
            return Err(OrchestratorError::Runtime(format!(
                "failed to remove {}: {}",
                process.name, remove.stderr
            )));
        }
        Ok(())
    }

    async fn is_running(&self, process: &ProcessHandle) -> Result<bool> {
        let output = self
            .exec(&["inspect", "-f", "{{.State.Running}}", &process.name])
            .await?;
        if output.success {
            Ok(output.stdout == "true")
        } else if is_missing(&output.stderr) {
            Ok(false)
        } else {
            Err(OrchestratorError::Runtime(format!(
                "failed to inspect {}: {}",
                process.name, output.stderr
            )))
        }
    }
}

#[async_trait]
impl HealthProbe for DockerBackend {
    async fn probe(&self, process: &ProcessHandle, check: &ProbeKind) -> Result<bool> {
        match check {
            ProbeKind::Running => self.is_running(process).await,
            ProbeKind::Command { argv } => {
                let mut args = vec!["exec", process.name.as_str()];
                args.extend(argv.iter().map(String::as_str));
                Ok(self.exec(&args).await?.success)
            }
            ProbeKind::Tcp { host, port } => Ok(ports::tcp_reachable(host, *port).await),
        }
    }
}
