//! Narrow interfaces to the outside world: images, processes, health.
//!
//! The orchestrator and reconciler only ever talk to these traits. The
//! docker backend drives the `docker` CLI; `SimulatedRuntime` scripts them
//! in memory for tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    CpuQuantity, ImageHandle, ImageRef, MemoryQuantity, Model, NetworkSpec, PortBinding,
    ProbeKind, ProcessHandle, ServiceSpec, VolumeSource, VolumeSpec,
};

/// Label keys stamped on every container the engine launches.
pub const PROJECT_LABEL: &str = "io.envo.project";
pub const SERVICE_LABEL: &str = "io.envo.service";
pub const FINGERPRINT_LABEL: &str = "io.envo.fingerprint";

/// A mount resolved to runtime names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Runtime volume name, or a host path for bind mounts.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything a runtime needs to launch one service.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub project: String,
    pub service: String,
    pub container_name: String,
    pub image: ImageHandle,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    /// Runtime network names; the first one is attached at creation.
    pub networks: Vec<String>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub cpu_limit: Option<CpuQuantity>,
    pub memory_limit: Option<MemoryQuantity>,
    pub memory_reservation: Option<MemoryQuantity>,
    pub fingerprint: String,
}

impl LaunchSpec {
    pub fn new(model: &Model, service: &ServiceSpec, image: ImageHandle) -> Self {
        let mounts = service
            .volumes
            .iter()
            .map(|binding| Mount {
                source: match &binding.source {
                    VolumeSource::Named(name) => model.volume_runtime_name(name),
                    VolumeSource::Bind(path) => path.clone(),
                },
                target: binding.target.clone(),
                read_only: binding.read_only,
            })
            .collect();

        Self {
            project: model.project.clone(),
            service: service.name.clone(),
            container_name: model.container_name(&service.name),
            image,
            environment: service.environment.clone(),
            ports: service.ports.clone(),
            mounts,
            networks: service
                .networks
                .iter()
                .map(|n| model.network_runtime_name(n))
                .collect(),
            command: service.command.clone(),
            working_dir: service.working_dir.clone(),
            cpu_limit: service.resources.cpu_limit,
            memory_limit: service.resources.memory_limit,
            memory_reservation: service.resources.memory_reservation,
            fingerprint: service.fingerprint(),
        }
    }
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Make the image available locally. Transient failures are
    /// `ImageUnavailable`; a reference the registry rejects is `ImageInvalid`.
    async fn fetch_image(&self, reference: &ImageRef) -> Result<ImageHandle>;
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the network if absent. Returns whether it was created now.
    async fn ensure_network(&self, network: &NetworkSpec, runtime_name: &str) -> Result<bool>;

    async fn remove_network(&self, runtime_name: &str) -> Result<()>;

    /// Create the volume if absent. Returns whether it was created now.
    async fn ensure_volume(&self, volume: &VolumeSpec, runtime_name: &str) -> Result<bool>;

    async fn remove_volume(&self, runtime_name: &str) -> Result<()>;

    /// Launch a process. Failing to launch is `StartFailed`.
    async fn start_process(&self, launch: &LaunchSpec) -> Result<ProcessHandle>;

    /// Stop and remove a process, waiting at most `grace` before killing it.
    async fn stop_process(&self, process: &ProcessHandle, grace: Duration) -> Result<()>;

    async fn is_running(&self, process: &ProcessHandle) -> Result<bool>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One probe attempt. `Ok(false)` means unhealthy; errors are treated the same.
    async fn probe(&self, process: &ProcessHandle, check: &ProbeKind) -> Result<bool>;
}

/// The external collaborators one orchestrator run uses.
#[derive(Clone)]
pub struct Collaborators {
    pub images: Arc<dyn ImageProvider>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn HealthProbe>,
}

impl Collaborators {
    pub fn new(
        images: Arc<dyn ImageProvider>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            images,
            runtime,
            probe,
        }
    }

    /// One object that plays all three roles.
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: ImageProvider + ContainerRuntime + HealthProbe + 'static,
    {
        Self {
            images: backend.clone(),
            runtime: backend.clone(),
            probe: backend,
        }
    }
}
