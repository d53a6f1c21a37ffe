//! Scripted in-memory backend.
//!
//! Plays all three collaborator roles. Behaviour is configured per image or
//! per service, and every call is appended to an event log that tests assert
//! on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{OrchestratorError, Result};
use crate::models::{ImageHandle, ImageRef, NetworkSpec, ProbeKind, ProcessHandle, VolumeSpec};
use crate::services::runtime::{ContainerRuntime, HealthProbe, ImageProvider, LaunchSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    ImageFetched(String),
    ImageFetchFailed(String),
    NetworkCreated(String),
    NetworkRemoved(String),
    VolumeCreated(String),
    VolumeRemoved(String),
    Started(String),
    StartFailed(String),
    Stopped(String),
    Probed(String),
}

#[derive(Debug, Default)]
struct ImageScript {
    unavailable_remaining: u32,
    invalid: bool,
    delay: Duration,
}

#[derive(Debug, Default)]
struct ServiceScript {
    start_failure: Option<String>,
    start_delay: Duration,
    /// Probes that fail before the first success.
    unhealthy_probes: u32,
    /// Every probe fails while set.
    unhealthy: bool,
    /// Probes never return.
    probe_hangs: bool,
}

#[derive(Debug)]
struct SimProcess {
    service: String,
    running: bool,
}

#[derive(Debug, Default)]
struct SimState {
    images: BTreeMap<String, ImageScript>,
    services: BTreeMap<String, ServiceScript>,
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
    processes: BTreeMap<String, SimProcess>,
    next_id: u64,
    events: Vec<RuntimeEvent>,
    fetch_attempts: BTreeMap<String, u32>,
    starts: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    state: Mutex<SimState>,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The first `attempts` fetches of `image` fail with `ImageUnavailable`.
    pub fn fail_image(&self, image: &str, attempts: u32) -> &Self {
        self.lock()
            .images
            .entry(image.to_string())
            .or_default()
            .unavailable_remaining = attempts;
        self
    }

    /// Every fetch of `image` fails with `ImageInvalid`.
    pub fn reject_image(&self, image: &str) -> &Self {
        self.lock().images.entry(image.to_string()).or_default().invalid = true;
        self
    }

    pub fn delay_image(&self, image: &str, delay: Duration) -> &Self {
        self.lock().images.entry(image.to_string()).or_default().delay = delay;
        self
    }

    pub fn fail_start(&self, service: &str, reason: &str) -> &Self {
        self.lock()
            .services
            .entry(service.to_string())
            .or_default()
            .start_failure = Some(reason.to_string());
        self
    }

    pub fn delay_start(&self, service: &str, delay: Duration) -> &Self {
        self.lock()
            .services
            .entry(service.to_string())
            .or_default()
            .start_delay = delay;
        self
    }

    /// The first `probes` probes of `service` report unhealthy.
    pub fn unhealthy_for(&self, service: &str, probes: u32) -> &Self {
        self.lock()
            .services
            .entry(service.to_string())
            .or_default()
            .unhealthy_probes = probes;
        self
    }

    pub fn set_healthy(&self, service: &str, healthy: bool) -> &Self {
        self.lock()
            .services
            .entry(service.to_string())
            .or_default()
            .unhealthy = !healthy;
        self
    }

    pub fn hang_probes(&self, service: &str) -> &Self {
        self.lock()
            .services
            .entry(service.to_string())
            .or_default()
            .probe_hangs = true;
        self
    }

    /// Mark the service's process as exited.
    pub fn kill(&self, service: &str) {
        for process in self.lock().processes.values_mut() {
            if process.service == service {
                process.running = false;
            }
        }
    }

    pub fn add_network(&self, runtime_name: &str) {
        self.lock().networks.insert(runtime_name.to_string());
    }

    pub fn add_volume(&self, runtime_name: &str) {
        self.lock().volumes.insert(runtime_name.to_string());
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.lock().events.clone()
    }

    pub fn networks(&self) -> BTreeSet<String> {
        self.lock().networks.clone()
    }

    pub fn volumes(&self) -> BTreeSet<String> {
        self.lock().volumes.clone()
    }

    /// Services with a live process.
    pub fn running_services(&self) -> BTreeSet<String> {
        self.lock()
            .processes
            .values()
            .filter(|p| p.running)
            .map(|p| p.service.clone())
            .collect()
    }

    pub fn start_count(&self, service: &str) -> u32 {
        self.lock().starts.get(service).copied().unwrap_or(0)
    }

    pub fn fetch_attempts(&self, image: &str) -> u32 {
        self.lock().fetch_attempts.get(image).copied().unwrap_or(0)
    }

    /// Position of the first matching event, for ordering assertions.
    pub fn position(&self, event: &RuntimeEvent) -> Option<usize> {
        self.lock().events.iter().position(|e| e == event)
    }
}

#[async_trait]
impl ImageProvider for SimulatedRuntime {
    async fn fetch_image(&self, reference: &ImageRef) -> Result<ImageHandle> {
        let key = reference.to_string();
        let delay = self
            .lock()
            .images
            .get(&key)
            .map(|s| s.delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        *state.fetch_attempts.entry(key.clone()).or_default() += 1;
        let script = state.images.entry(key.clone()).or_default();
        let outcome = if script.invalid {
            Err(OrchestratorError::ImageInvalid {
                image: key.clone(),
                reason: "manifest rejected".into(),
            })
        } else if script.unavailable_remaining > 0 {
            script.unavailable_remaining -= 1;
            Err(OrchestratorError::ImageUnavailable {
                image: key.clone(),
                reason: "registry timeout".into(),
            })
        } else {
            Ok(ImageHandle {
                reference: key.clone(),
                id: format!("sha256:{}", key.len()),
            })
        };
        state.events.push(match &outcome {
            Ok(_) => RuntimeEvent::ImageFetched(key),
            Err(_) => RuntimeEvent::ImageFetchFailed(key),
        });
        outcome
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn ensure_network(&self, _network: &NetworkSpec, runtime_name: &str) -> Result<bool> {
        let mut state = self.lock();
        let created = state.networks.insert(runtime_name.to_string());
        if created {
            state
                .events
                .push(RuntimeEvent::NetworkCreated(runtime_name.to_string()));
        }
        Ok(created)
    }

    async fn remove_network(&self, runtime_name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.networks.remove(runtime_name) {
            state
                .events
                .push(RuntimeEvent::NetworkRemoved(runtime_name.to_string()));
        }
        Ok(())
    }

    async fn ensure_volume(&self, _volume: &VolumeSpec, runtime_name: &str) -> Result<bool> {
        let mut state = self.lock();
        let created = state.volumes.insert(runtime_name.to_string());
        if created {
            state
                .events
                .push(RuntimeEvent::VolumeCreated(runtime_name.to_string()));
        }
        Ok(created)
    }

    async fn remove_volume(&self, runtime_name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.volumes.remove(runtime_name) {
            state
                .events
                .push(RuntimeEvent::VolumeRemoved(runtime_name.to_string()));
        }
        Ok(())
    }

    async fn start_process(&self, launch: &LaunchSpec) -> Result<ProcessHandle> {
        let delay = self
            .lock()
            .services
            .get(&launch.service)
            .map(|s| s.start_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        for network in &launch.networks {
            if !state.networks.contains(network) {
                return Err(OrchestratorError::StartFailed {
                    service: launch.service.clone(),
                    reason: format!("network {network} not found"),
                });
            }
        }
        if let Some(reason) = state
            .services
            .get(&launch.service)
            .and_then(|s| s.start_failure.clone())
        {
            state
                .events
                .push(RuntimeEvent::StartFailed(launch.service.clone()));
            return Err(OrchestratorError::StartFailed {
                service: launch.service.clone(),
                reason,
            });
        }

        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        state.processes.insert(
            id.clone(),
            SimProcess {
                service: launch.service.clone(),
                running: true,
            },
        );
        *state.starts.entry(launch.service.clone()).or_default() += 1;
        state.events.push(RuntimeEvent::Started(launch.service.clone()));
        Ok(ProcessHandle {
            id,
            name: launch.container_name.clone(),
        })
    }

    async fn stop_process(&self, process: &ProcessHandle, _grace: Duration) -> Result<()> {
        let mut state = self.lock();
        if let Some(record) = state.processes.remove(&process.id) {
            state.events.push(RuntimeEvent::Stopped(record.service));
        }
        Ok(())
    }

    async fn is_running(&self, process: &ProcessHandle) -> Result<bool> {
        Ok(self
            .lock()
            .processes
            .get(&process.id)
            .is_some_and(|p| p.running))
    }
}

#[async_trait]
impl HealthProbe for SimulatedRuntime {
    async fn probe(&self, process: &ProcessHandle, _check: &ProbeKind) -> Result<bool> {
        let hangs = {
            let mut state = self.lock();
            let Some(service) = state
                .processes
                .get(&process.id)
                .filter(|p| p.running)
                .map(|p| p.service.clone())
            else {
                return Ok(false);
            };
            state.events.push(RuntimeEvent::Probed(service.clone()));
            let script = state.services.entry(service).or_default();
            if script.probe_hangs {
                true
            } else if script.unhealthy {
                return Ok(false);
            } else if script.unhealthy_probes > 0 {
                script.unhealthy_probes -= 1;
                return Ok(false);
            } else {
                return Ok(true);
            }
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(reference: &str) -> ImageRef {
        ImageRef::parse(reference).unwrap()
    }

    #[tokio::test]
    async fn scripted_image_failures_run_out() {
        let sim = SimulatedRuntime::new();
        sim.fail_image("postgres:16", 2);
        let reference = image("postgres:16");

        assert!(sim.fetch_image(&reference).await.unwrap_err().is_retryable());
        assert!(sim.fetch_image(&reference).await.is_err());
        assert!(sim.fetch_image(&reference).await.is_ok());
        assert_eq!(sim.fetch_attempts("postgres:16"), 3);
    }

    #[tokio::test]
    async fn killed_process_is_not_running() {
        let sim = SimulatedRuntime::new();
        sim.add_network("dev_default");
        let launch = LaunchSpec {
            project: "dev".into(),
            service: "app".into(),
            container_name: "dev-app".into(),
            image: ImageHandle {
                reference: "app".into(),
                id: "1".into(),
            },
            environment: BTreeMap::new(),
            ports: vec![],
            mounts: vec![],
            networks: vec!["dev_default".into()],
            command: None,
            working_dir: None,
            cpu_limit: None,
            memory_limit: None,
            memory_reservation: None,
            fingerprint: String::new(),
        };
        let process = sim.start_process(&launch).await.unwrap();
        assert!(sim.is_running(&process).await.unwrap());
        assert!(sim.probe(&process, &ProbeKind::Running).await.unwrap());

        sim.kill("app");
        assert!(!sim.is_running(&process).await.unwrap());
        assert!(!sim.probe(&process, &ProbeKind::Running).await.unwrap());
        assert_eq!(sim.running_services().len(), 0);
    }
}
