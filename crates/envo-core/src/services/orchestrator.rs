//! Drives every service through its lifecycle.
//!
//! Each service runs as its own task. Tasks coordinate only through the
//! state table (a `watch` channel): a task waits there until its
//! predecessors have settled, then fetches, launches and health-checks its
//! process. The resource ledger is touched once, up front, through the
//! serialized [`ResourceAllocator`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::error::{OrchestratorError, Result};
use crate::models::{
    DependencyCondition, EnvironmentState, ImageHandle, ImageRef, Model, ProcessHandle,
    RunReport, ServiceOutcome, ServiceRuntimeState, ServiceSpec, ServiceState, TeardownReport,
};
use crate::services::allocator::{HostCapacity, ResourceAllocator, ResourceLedger};
use crate::services::graph::DependencyGraph;
use crate::services::registry::ResourceRegistry;
use crate::services::runtime::{Collaborators, LaunchSpec};
use crate::services::state::StateStore;

pub type StateTable = BTreeMap<String, ServiceRuntimeState>;

/// Whether `record` meets `condition` for a dependent.
pub fn condition_satisfied(record: &ServiceRuntimeState, condition: DependencyCondition) -> bool {
    match condition {
        DependencyCondition::ServiceStarted => matches!(
            record.state,
            ServiceState::HealthChecking | ServiceState::Running | ServiceState::Degraded
        ),
        DependencyCondition::ServiceHealthy => record.state == ServiceState::Running,
    }
}

/// Whether `record` can no longer meet `condition` during this run.
pub fn condition_unreachable(record: &ServiceRuntimeState, condition: DependencyCondition) -> bool {
    matches!(
        record.state,
        ServiceState::Failed | ServiceState::Stopping | ServiceState::Stopped
    ) || record.blocked_by.is_some()
        || (condition == DependencyCondition::ServiceHealthy
            && record.state == ServiceState::Degraded)
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    model: Model,
    graph: DependencyGraph,
    collaborators: Collaborators,
    allocator: ResourceAllocator,
    registry: Mutex<ResourceRegistry>,
    states: watch::Sender<StateTable>,
    /// Services with a launch task running in this process.
    launches: watch::Sender<BTreeSet<String>>,
    /// Persisted services that are no longer part of the model.
    orphans: Mutex<Vec<ServiceRuntimeState>>,
    store: Option<StateStore>,
    persist_lock: Mutex<()>,
}

impl Orchestrator {
    /// Fails with `CyclicDependency` before anything else happens.
    pub fn new(model: Model, collaborators: Collaborators, capacity: HostCapacity) -> Result<Self> {
        Self::build(model, collaborators, capacity, None)
    }

    /// Like [`Orchestrator::new`], persisting every transition to `store`.
    pub fn with_store(
        model: Model,
        collaborators: Collaborators,
        capacity: HostCapacity,
        store: StateStore,
    ) -> Result<Self> {
        Self::build(model, collaborators, capacity, Some(store))
    }

    fn build(
        model: Model,
        collaborators: Collaborators,
        capacity: HostCapacity,
        store: Option<StateStore>,
    ) -> Result<Self> {
        let graph = DependencyGraph::build(&model)?;
        let table: StateTable = graph
            .order()
            .iter()
            .map(|name| (name.clone(), ServiceRuntimeState::new(name.clone())))
            .collect();
        let (states, _) = watch::channel(table);
        let (launches, _) = watch::channel(BTreeSet::new());
        Ok(Self {
            inner: Arc::new(Inner {
                model,
                graph,
                collaborators,
                allocator: ResourceAllocator::new(capacity),
                registry: Mutex::new(ResourceRegistry::new()),
                states,
                launches,
                orphans: Mutex::new(Vec::new()),
                store,
                persist_lock: Mutex::new(()),
            }),
        })
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn subscribe(&self) -> watch::Receiver<StateTable> {
        self.inner.states.subscribe()
    }

    pub fn record(&self, name: &str) -> Option<ServiceRuntimeState> {
        self.inner.states.borrow().get(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.inner.states.borrow().get(name).map(|r| r.state)
    }

    /// Every service record in topological order.
    pub fn snapshot(&self) -> Vec<ServiceRuntimeState> {
        let table = self.inner.states.borrow();
        self.inner
            .graph
            .order()
            .iter()
            .filter_map(|name| table.get(name).cloned())
            .collect()
    }

    pub async fn ledger(&self) -> ResourceLedger {
        self.inner.allocator.snapshot().await
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            services: self
                .snapshot()
                .into_iter()
                .map(|r| ServiceOutcome {
                    name: r.name,
                    state: r.state,
                    error: r.last_error,
                    blocked_by: r.blocked_by,
                })
                .collect(),
        }
    }

    /// Merge persisted state from an earlier run. Returns whether a state file existed.
    pub async fn load_state(&self) -> Result<bool> {
        let Some(store) = &self.inner.store else {
            return Ok(false);
        };
        let Some(persisted) = store.load().await? else {
            return Ok(false);
        };
        if persisted.project != self.inner.model.project {
            tracing::warn!(
                persisted = %persisted.project,
                project = %self.inner.model.project,
                "state file belongs to another project, ignoring"
            );
            return Ok(false);
        }

        let mut orphans = Vec::new();
        self.inner.states.send_modify(|table| {
            for record in persisted.services {
                match table.get_mut(&record.name) {
                    Some(slot) => *slot = record,
                    None if record.process.is_some() => orphans.push(record),
                    None => {}
                }
            }
        });
        *self.inner.orphans.lock().await = orphans;
        *self.inner.registry.lock().await =
            ResourceRegistry::with_created(persisted.created_networks, persisted.created_volumes);
        Ok(true)
    }

    /// Bring the environment up. Load-time failures (cycles, capacity)
    /// return `Err` before anything starts; per-service failures end up in
    /// the report.
    pub async fn up(&self) -> Result<RunReport> {
        let inner = &self.inner;
        inner.allocator.allocate(&inner.graph, &inner.model).await?;

        self.remove_orphans().await;

        let mut adopted = BTreeSet::new();
        for name in inner.graph.order() {
            let service = self.service(name)?;
            if self.try_adopt(service).await {
                adopted.insert(name.clone());
            }
        }
        self.persist().await;

        let mut units = JoinSet::new();
        for name in inner.graph.order() {
            if adopted.contains(name) {
                self.hold_resources(self.service(name)?).await;
                continue;
            }
            let this = self.clone();
            let name = name.clone();
            let launch = self.begin_launch(&name);
            units.spawn(async move {
                let _launch = launch;
                this.run_unit(name).await
            });
        }
        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "service task aborted");
            }
        }

        self.persist().await;
        let report = self.report();
        for chain in report.failures() {
            tracing::error!("{}", chain.describe());
        }
        Ok(report)
    }

    /// Keep a still-running process whose spec is unchanged; otherwise
    /// stop whatever is left and reset the record.
    async fn try_adopt(&self, service: &ServiceSpec) -> bool {
        let Some(record) = self.record(&service.name) else {
            return false;
        };
        let fingerprint = service.fingerprint();

        if let Some(process) = &record.process {
            let running = self
                .inner
                .collaborators
                .runtime
                .is_running(process)
                .await
                .unwrap_or(false);
            if running
                && record.state.is_up()
                && record.fingerprint.as_deref() == Some(fingerprint.as_str())
            {
                tracing::info!(service = %service.name, "adopting running process");
                return true;
            }
            if running {
                tracing::info!(service = %service.name, "spec changed, recreating");
            }
            if let Err(e) = self
                .inner
                .collaborators
                .runtime
                .stop_process(process, self.inner.model.engine.stop_grace_period)
                .await
            {
                tracing::warn!(service = %service.name, error = %e, "failed to remove stale process");
            }
        }

        self.inner.states.send_modify(|table| {
            table.insert(
                service.name.clone(),
                ServiceRuntimeState::new(service.name.clone()),
            );
        });
        false
    }

    async fn remove_orphans(&self) {
        let orphans = std::mem::take(&mut *self.inner.orphans.lock().await);
        for orphan in orphans {
            if let Some(process) = &orphan.process {
                tracing::info!(service = %orphan.name, "removing orphaned process");
                if let Err(e) = self
                    .inner
                    .collaborators
                    .runtime
                    .stop_process(process, self.inner.model.engine.stop_grace_period)
                    .await
                {
                    tracing::warn!(service = %orphan.name, error = %e, "failed to remove orphan");
                }
            }
        }
    }

    fn service(&self, name: &str) -> Result<&ServiceSpec> {
        self.inner
            .model
            .service(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))
    }

    fn begin_launch(&self, name: &str) -> LaunchGuard {
        self.inner.launches.send_modify(|launches| {
            launches.insert(name.to_string());
        });
        LaunchGuard {
            inner: self.inner.clone(),
            name: name.to_string(),
        }
    }

    async fn run_unit(self, name: String) {
        if let Err(e) = self.drive(&name).await {
            self.fail(&name, &e).await;
        }
    }

    async fn drive(&self, name: &str) -> Result<()> {
        let service = self.service(name)?;

        self.provision(service).await?;
        self.transition(name, ServiceState::NetworkReady, |_| {})
            .await?;

        if let Some(blocker) = self.wait_for_dependencies(name).await {
            tracing::warn!(service = name, blocked_by = %blocker, "dependency cannot be satisfied");
            self.modify(name, |r| r.blocked_by = Some(blocker)).await;
            return Ok(());
        }

        let image = self.fetch_image(service).await?;
        self.transition(name, ServiceState::ImageReady, |_| {})
            .await?;
        self.transition(name, ServiceState::Starting, |_| {})
            .await?;
        self.start_and_settle(service, image).await
    }

    /// Create (if absent) and take a reference on every network and volume
    /// the service uses.
    async fn provision(&self, service: &ServiceSpec) -> Result<()> {
        let model = &self.inner.model;
        let runtime = &self.inner.collaborators.runtime;
        let mut registry = self.inner.registry.lock().await;

        for network in &service.networks {
            let spec = model
                .networks
                .get(network)
                .ok_or_else(|| OrchestratorError::invalid_field("networks", network.clone()))?;
            let runtime_name = model.network_runtime_name(network);
            if !spec.external && runtime.ensure_network(spec, &runtime_name).await? {
                tracing::info!(network = %runtime_name, "network created");
                registry.record_created_network(&runtime_name);
            }
            registry.hold_network(&service.name, network);
        }
        for volume in service.named_volumes() {
            let spec = model
                .volumes
                .get(volume)
                .ok_or_else(|| OrchestratorError::invalid_field("volumes", volume.to_string()))?;
            let runtime_name = model.volume_runtime_name(volume);
            if !spec.external && runtime.ensure_volume(spec, &runtime_name).await? {
                tracing::info!(volume = %runtime_name, "volume created");
                registry.record_created_volume(&runtime_name);
            }
            registry.hold_volume(&service.name, volume);
        }
        Ok(())
    }

    async fn hold_resources(&self, service: &ServiceSpec) {
        let mut registry = self.inner.registry.lock().await;
        for network in &service.networks {
            registry.hold_network(&service.name, network);
        }
        for volume in service.named_volumes() {
            registry.hold_volume(&service.name, volume);
        }
    }

    /// Wait until every predecessor has either met its condition or can no
    /// longer meet it. Returns the first predecessor that cannot.
    async fn wait_for_dependencies(&self, name: &str) -> Option<String> {
        let conditions: Vec<(String, DependencyCondition)> = self
            .inner
            .graph
            .predecessors(name)
            .into_iter()
            .filter_map(|p| {
                self.inner
                    .graph
                    .condition(name, p)
                    .map(|c| (p.to_string(), c))
            })
            .collect();
        if conditions.is_empty() {
            return None;
        }

        let settled = |table: &StateTable| {
            conditions.iter().all(|(p, c)| {
                table
                    .get(p)
                    .map_or(true, |r| condition_satisfied(r, *c) || condition_unreachable(r, *c))
            })
        };

        let mut rx = self.inner.states.subscribe();
        let table = match rx.wait_for(settled).await {
            Ok(table) => table.clone(),
            Err(_) => return conditions.first().map(|(p, _)| p.clone()),
        };
        conditions
            .iter()
            .find(|(p, c)| table.get(p).map_or(true, |r| !condition_satisfied(r, *c)))
            .map(|(p, _)| p.clone())
    }

    /// Fetch with exponential backoff. Only `ImageUnavailable` is retried;
    /// each attempt is bounded by `image_pull.timeout`.
    async fn fetch_image(&self, service: &ServiceSpec) -> Result<ImageHandle> {
        let reference = ImageRef::parse(&service.image)?;
        let pull = &self.inner.model.engine.image_pull;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(pull.initial_backoff)
            .with_max_delay(pull.max_backoff)
            .with_max_times(pull.attempts.saturating_sub(1) as usize);

        let images = &self.inner.collaborators.images;
        let reference = &reference;
        let timeout = pull.timeout;
        let attempt = move || async move {
            match tokio::time::timeout(timeout, images.fetch_image(reference)).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::ImageUnavailable {
                    image: reference.to_string(),
                    reason: format!("fetch timed out after {timeout:?}"),
                }),
            }
        };

        let image = attempt
            .retry(backoff)
            .when(OrchestratorError::is_retryable)
            .notify(|e, delay: Duration| {
                tracing::warn!(
                    service = %service.name,
                    error = %e,
                    "image fetch failed, retrying in {delay:?}"
                );
            })
            .await?;
        tracing::debug!(service = %service.name, image = %image.reference, id = %image.id, "image ready");
        Ok(image)
    }

    /// Launch from `Starting`, then health-check to Running or Degraded.
    async fn start_and_settle(&self, service: &ServiceSpec, image: ImageHandle) -> Result<()> {
        let name = service.name.as_str();
        let launch = LaunchSpec::new(&self.inner.model, service, image);
        let process = self
            .inner
            .collaborators
            .runtime
            .start_process(&launch)
            .await?;

        let fingerprint = launch.fingerprint.clone();
        let handle = process.clone();
        self.transition(name, ServiceState::HealthChecking, move |r| {
            r.process = Some(handle);
            r.fingerprint = Some(fingerprint);
            r.started_at = Some(Utc::now());
        })
        .await?;

        if self.await_healthy(service, &process).await {
            self.transition(name, ServiceState::Running, |r| r.last_error = None)
                .await
        } else {
            let timeout = OrchestratorError::HealthTimeout {
                service: name.to_string(),
                timeout: service.healthcheck.start_period,
            };
            tracing::warn!(service = name, "{timeout}; marking degraded");
            let message = timeout.to_string();
            self.transition(name, ServiceState::Degraded, move |r| {
                r.last_error = Some(message)
            })
            .await
        }
    }

    /// Probe on `interval` until healthy or `start_period` runs out.
    async fn await_healthy(&self, service: &ServiceSpec, process: &ProcessHandle) -> bool {
        let check = &service.healthcheck;
        let probe = &self.inner.collaborators.probe;
        let attempts = async {
            loop {
                if probe_once(probe.as_ref(), process, check).await {
                    return;
                }
                tokio::time::sleep(check.interval).await;
            }
        };
        tokio::time::timeout(check.start_period, attempts)
            .await
            .is_ok()
    }

    async fn fail(&self, name: &str, error: &OrchestratorError) {
        tracing::error!(service = name, error = %error, "service failed");
        let message = error.to_string();
        if let Err(e) = self
            .transition(name, ServiceState::Failed, move |r| {
                r.last_error = Some(message)
            })
            .await
        {
            tracing::error!(service = name, error = %e, "could not record failure");
        }
    }

    /// Validate and apply one state transition, then persist.
    pub(crate) async fn transition<F>(&self, name: &str, next: ServiceState, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceRuntimeState),
    {
        let mut outcome = Ok(ServiceState::Pending);
        self.inner.states.send_if_modified(|table| {
            let Some(record) = table.get_mut(name) else {
                outcome = Err(OrchestratorError::ServiceNotFound(name.to_string()));
                return false;
            };
            if !record.state.can_transition_to(next) {
                outcome = Err(OrchestratorError::Runtime(format!(
                    "illegal transition {} -> {next} for service '{name}'",
                    record.state
                )));
                return false;
            }
            outcome = Ok(record.state);
            record.state = next;
            record.updated_at = Utc::now();
            apply(record);
            true
        });
        let previous = outcome?;
        tracing::info!(service = name, from = %previous, to = %next, "state changed");
        self.persist().await;
        Ok(())
    }

    /// Change a record without a state transition, then persist.
    pub(crate) async fn modify<F>(&self, name: &str, apply: F)
    where
        F: FnOnce(&mut ServiceRuntimeState),
    {
        self.inner.states.send_if_modified(|table| match table.get_mut(name) {
            Some(record) => {
                apply(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        });
        self.persist().await;
    }

    async fn environment_state(&self) -> EnvironmentState {
        let mut services = self.snapshot();
        services.extend(self.inner.orphans.lock().await.iter().cloned());
        let registry = self.inner.registry.lock().await;
        EnvironmentState {
            project: self.inner.model.project.clone(),
            services,
            created_networks: registry.created_networks(),
            created_volumes: registry.created_volumes(),
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let _guard = self.inner.persist_lock.lock().await;
        let state = self.environment_state().await;
        if let Err(e) = store.save(&state).await {
            tracing::warn!(error = %e, "failed to persist state");
        }
    }

    /// Stop the current process (if any) and launch a fresh one from `Starting`.
    /// Dependents are left alone.
    pub async fn restart_service(&self, name: &str) -> Result<()> {
        let service = self.service(name)?;
        let _launch = self.begin_launch(name);
        let record = self
            .record(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;

        if let Some(process) = &record.process {
            if let Err(e) = self
                .inner
                .collaborators
                .runtime
                .stop_process(process, self.inner.model.engine.stop_grace_period)
                .await
            {
                tracing::warn!(service = name, error = %e, "failed to stop before restart");
            }
        }

        self.transition(name, ServiceState::Starting, |r| {
            r.restart_count += 1;
            r.process = None;
        })
        .await?;

        let result = match self.fetch_image(service).await {
            Ok(image) => self.start_and_settle(service, image).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.fail(name, e).await;
        }
        result
    }

    /// Running <-> Degraded as seen by the reconciler.
    pub(crate) async fn set_health(&self, name: &str, healthy: bool) -> Result<()> {
        let next = if healthy {
            ServiceState::Running
        } else {
            ServiceState::Degraded
        };
        if self.state_of(name) == Some(next) {
            return Ok(());
        }
        self.transition(name, next, |r| {
            if healthy {
                r.last_error = None;
            }
        })
        .await
    }

    /// Give up on a service after its restart budget is spent.
    pub(crate) async fn mark_exhausted(&self, name: &str, restarts: u32, window: Duration) {
        let error = OrchestratorError::ReconcileExhausted {
            service: name.to_string(),
            restarts,
            window,
        };
        self.fail(name, &error).await;
    }

    /// Tear everything down, dependents first. Volumes the engine created
    /// are removed unless `keep_volumes` is set.
    pub async fn down(&self, keep_volumes: bool) -> Result<TeardownReport> {
        self.remove_orphans().await;
        {
            let mut registry = self.inner.registry.lock().await;
            for service in self.inner.model.services.values() {
                for network in &service.networks {
                    registry.hold_network(&service.name, network);
                }
                for volume in service.named_volumes() {
                    registry.hold_volume(&service.name, volume);
                }
            }
        }

        let report = Arc::new(StdMutex::new(TeardownReport::default()));
        let (done_tx, _) = watch::channel(BTreeSet::<String>::new());
        let done_tx = Arc::new(done_tx);

        let mut units = JoinSet::new();
        for name in self.inner.graph.reverse_order() {
            let this = self.clone();
            let report = report.clone();
            let done_tx = done_tx.clone();
            units.spawn(async move {
                let successors: Vec<String> = this
                    .inner
                    .graph
                    .successors(&name)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let mut done_rx = done_tx.subscribe();
                let _ = done_rx
                    .wait_for(|done| successors.iter().all(|s| done.contains(s)))
                    .await;

                this.teardown_unit(&name, keep_volumes, &report).await;
                done_tx.send_modify(|done| {
                    done.insert(name);
                });
            });
        }
        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "teardown task aborted");
            }
        }

        self.remove_unreferenced(keep_volumes, &report).await;

        let report = std::mem::take(&mut *report.lock().unwrap_or_else(PoisonError::into_inner));
        if report.is_clean() {
            if let Some(store) = &self.inner.store {
                store.clear().await?;
            }
        } else {
            self.persist().await;
        }
        Ok(report)
    }

    async fn teardown_unit(&self, name: &str, keep_volumes: bool, report: &StdMutex<TeardownReport>) {
        let push_failure = |error: String| {
            report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failed
                .push((name.to_string(), error));
        };

        // A launch running in this process settles first. Records loaded
        // from disk have no task behind them and are stopped as they are.
        let mut launches = self.inner.launches.subscribe();
        let _ = launches.wait_for(|names| !names.contains(name)).await;
        drop(launches);

        let Some(record) = self.record(name) else {
            return;
        };
        if record.state.is_in_flight() || record.state == ServiceState::Stopping {
            tracing::warn!(service = name, state = %record.state, "stopping an unfinished launch from an earlier run");
        }

        let stopped = match (record.state, &record.process) {
            (ServiceState::Stopped, _) => true,
            (state, Some(process)) => {
                let stopping = if state == ServiceState::Stopping {
                    Ok(())
                } else {
                    self.transition(name, ServiceState::Stopping, |_| {}).await
                };
                let result = match stopping {
                    Ok(()) => self
                        .inner
                        .collaborators
                        .runtime
                        .stop_process(process, self.inner.model.engine.stop_grace_period)
                        .await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self
                        .transition(name, ServiceState::Stopped, |r| r.process = None)
                        .await
                        .is_ok(),
                    Err(e) => {
                        tracing::error!(service = name, error = %e, "failed to stop");
                        push_failure(e.to_string());
                        self.fail(name, &e).await;
                        false
                    }
                }
            }
            (_, None) => self
                .transition(name, ServiceState::Stopped, |_| {})
                .await
                .is_ok(),
        };

        if stopped {
            report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stopped
                .push(name.to_string());
        }

        self.inner.allocator.release(name).await;
        let released = self.inner.registry.lock().await.release(name);
        for network in released.networks {
            self.remove_network(&network, report).await;
        }
        if !keep_volumes {
            for volume in released.volumes {
                self.remove_volume(&volume, report).await;
            }
        }
    }

    async fn remove_network(&self, network: &str, report: &StdMutex<TeardownReport>) {
        let runtime_name = self.inner.model.network_runtime_name(network);
        if !self.inner.registry.lock().await.created_network(&runtime_name) {
            return;
        }
        match self
            .inner
            .collaborators
            .runtime
            .remove_network(&runtime_name)
            .await
        {
            Ok(()) => {
                tracing::info!(network = %runtime_name, "network removed");
                self.inner.registry.lock().await.forget_network(&runtime_name);
                report
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .removed_networks
                    .push(runtime_name);
            }
            Err(e) => report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failed
                .push((format!("network {runtime_name}"), e.to_string())),
        }
    }

    async fn remove_volume(&self, volume: &str, report: &StdMutex<TeardownReport>) {
        let runtime_name = self.inner.model.volume_runtime_name(volume);
        if !self.inner.registry.lock().await.created_volume(&runtime_name) {
            return;
        }
        match self
            .inner
            .collaborators
            .runtime
            .remove_volume(&runtime_name)
            .await
        {
            Ok(()) => {
                tracing::info!(volume = %runtime_name, "volume removed");
                self.inner.registry.lock().await.forget_volume(&runtime_name);
                report
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .removed_volumes
                    .push(runtime_name);
            }
            Err(e) => report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .failed
                .push((format!("volume {runtime_name}"), e.to_string())),
        }
    }

    /// Created resources nothing references any more (e.g. left by a
    /// service that was removed from the spec).
    async fn remove_unreferenced(&self, keep_volumes: bool, report: &StdMutex<TeardownReport>) {
        let (networks, volumes) = {
            let registry = self.inner.registry.lock().await;
            (registry.created_networks(), registry.created_volumes())
        };
        let model = &self.inner.model;
        for runtime_name in networks {
            let logical = model
                .networks
                .keys()
                .find(|n| model.network_runtime_name(n) == runtime_name);
            let referenced = match logical {
                Some(n) => self.inner.registry.lock().await.network_refs(n) > 0,
                None => false,
            };
            if referenced {
                continue;
            }
            match self
                .inner
                .collaborators
                .runtime
                .remove_network(&runtime_name)
                .await
            {
                Ok(()) => {
                    self.inner.registry.lock().await.forget_network(&runtime_name);
                    report
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .removed_networks
                        .push(runtime_name);
                }
                Err(e) => tracing::warn!(network = %runtime_name, error = %e, "failed to remove network"),
            }
        }
        if keep_volumes {
            return;
        }
        for runtime_name in volumes {
            let logical = model
                .volumes
                .keys()
                .find(|v| model.volume_runtime_name(v) == runtime_name);
            let referenced = match logical {
                Some(v) => self.inner.registry.lock().await.volume_refs(v) > 0,
                None => false,
            };
            if referenced {
                continue;
            }
            match self
                .inner
                .collaborators
                .runtime
                .remove_volume(&runtime_name)
                .await
            {
                Ok(()) => {
                    self.inner.registry.lock().await.forget_volume(&runtime_name);
                    report
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .removed_volumes
                        .push(runtime_name);
                }
                Err(e) => tracing::warn!(volume = %runtime_name, error = %e, "failed to remove volume"),
            }
        }
    }
}

/// Holds a service in the launch set until dropped.
struct LaunchGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        self.inner.launches.send_modify(|launches| {
            launches.remove(&self.name);
        });
    }
}

/// One probe bounded by the check's per-probe timeout. Errors count as unhealthy.
pub(crate) async fn probe_once(
    probe: &dyn crate::services::runtime::HealthProbe,
    process: &ProcessHandle,
    check: &crate::models::HealthCheck,
) -> bool {
    match tokio::time::timeout(check.timeout, probe.probe(process, &check.probe)).await {
        Ok(Ok(healthy)) => healthy,
        Ok(Err(e)) => {
            tracing::debug!(process = %process.name, error = %e, "probe error");
            false
        }
        Err(_) => {
            tracing::debug!(process = %process.name, "probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::loader::{load, LoadOptions};
    use crate::services::simulated::{RuntimeEvent, SimulatedRuntime};

    fn capacity() -> HostCapacity {
        HostCapacity {
            cpu_millis: 8000,
            memory_bytes: 16 << 30,
        }
    }

    fn orchestrator(yaml: &str) -> (Orchestrator, Arc<SimulatedRuntime>) {
        let model = load(yaml, &LoadOptions::default()).unwrap();
        let sim = Arc::new(SimulatedRuntime::new());
        let orchestrator =
            Orchestrator::new(model, Collaborators::from_backend(sim.clone()), capacity())
                .unwrap();
        (orchestrator, sim)
    }

    #[test]
    fn condition_rules() {
        let mut record = ServiceRuntimeState::new("db".into());
        for (state, started, healthy) in [
            (ServiceState::NetworkReady, false, false),
            (ServiceState::HealthChecking, true, false),
            (ServiceState::Running, true, true),
            (ServiceState::Degraded, true, false),
        ] {
            record.state = state;
            assert_eq!(
                condition_satisfied(&record, DependencyCondition::ServiceStarted),
                started,
                "{state}"
            );
            assert_eq!(
                condition_satisfied(&record, DependencyCondition::ServiceHealthy),
                healthy,
                "{state}"
            );
        }

        record.state = ServiceState::Degraded;
        assert!(condition_unreachable(
            &record,
            DependencyCondition::ServiceHealthy
        ));
        assert!(!condition_unreachable(
            &record,
            DependencyCondition::ServiceStarted
        ));
        record.state = ServiceState::NetworkReady;
        record.blocked_by = Some("other".into());
        assert!(condition_unreachable(
            &record,
            DependencyCondition::ServiceStarted
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn up_runs_every_service() {
        let (orchestrator, sim) = orchestrator(
            r#"
name: dev
services:
  db: { image: "postgres:16" }
  app: { image: "app:1", depends_on: [db] }
"#,
        );
        let report = orchestrator.up().await.unwrap();
        assert!(report.all_running(), "{report:?}");
        assert_eq!(report.exit_code(), 0);
        assert!(
            sim.position(&RuntimeEvent::Started("db".into()))
                < sim.position(&RuntimeEvent::Started("app".into()))
        );
        assert!(sim.networks().contains("dev_default"));
    }

    #[tokio::test(start_paused = true)]
    async fn illegal_transition_is_rejected() {
        let (orchestrator, _sim) = orchestrator("services:\n  db: { image: postgres }\n");
        let err = orchestrator
            .transition("db", ServiceState::Running, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Runtime(_)));
        assert_eq!(orchestrator.state_of("db"), Some(ServiceState::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_is_fatal_and_isolated() {
        let (orchestrator, sim) = orchestrator(
            r#"
services:
  broken: { image: busybox }
  fine: { image: busybox }
"#,
        );
        sim.fail_start("broken", "exec format error");
        let report = orchestrator.up().await.unwrap();
        assert_eq!(report.outcome("broken").unwrap().state, ServiceState::Failed);
        assert!(report
            .outcome("broken")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("exec format error"));
        assert_eq!(report.outcome("fine").unwrap().state, ServiceState::Running);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_failure_aborts_before_any_start() {
        let model = load(
            r#"
services:
  big:
    image: busybox
    deploy: { resources: { reservations: { cpus: 64 } } }
"#,
            &LoadOptions::default(),
        )
        .unwrap();
        let sim = Arc::new(SimulatedRuntime::new());
        let orchestrator =
            Orchestrator::new(model, Collaborators::from_backend(sim.clone()), capacity())
                .unwrap();
        let err = orchestrator.up().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InsufficientCapacity { .. }));
        assert!(sim.events().is_empty());
        assert!(orchestrator.ledger().await.reservations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_fetch_errors_are_retried() {
        let (orchestrator, sim) = orchestrator("services:\n  db: { image: \"postgres:16\" }\n");
        sim.fail_image("postgres:16", 2);
        let report = orchestrator.up().await.unwrap();
        assert_eq!(report.outcome("db").unwrap().state, ServiceState::Running);
        assert_eq!(sim.fetch_attempts("postgres:16"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (orchestrator, sim) = orchestrator("services:\n  db: { image: \"postgres:16\" }\n");
        sim.fail_image("postgres:16", 10);
        let report = orchestrator.up().await.unwrap();
        let db = report.outcome("db").unwrap();
        assert_eq!(db.state, ServiceState::Failed);
        assert!(db.error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(sim.fetch_attempts("postgres:16"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_per_attempt() {
        let (orchestrator, sim) = orchestrator(
            r#"
services:
  db: { image: "postgres:16" }
engine:
  image_pull: { attempts: 2, timeout: 1s }
"#,
        );
        sim.delay_image("postgres:16", Duration::from_secs(30));
        let report = orchestrator.up().await.unwrap();
        let db = report.outcome("db").unwrap();
        assert_eq!(db.state, ServiceState::Failed);
        assert!(db.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn external_network_is_not_created() {
        let (orchestrator, sim) = orchestrator(
            r#"
name: dev
services:
  app: { image: busybox, networks: [shared] }
networks:
  shared: { external: true }
"#,
        );
        sim.add_network("shared");
        let report = orchestrator.up().await.unwrap();
        assert!(report.all_running());
        assert!(!sim
            .events()
            .iter()
            .any(|e| matches!(e, RuntimeEvent::NetworkCreated(_))));

        orchestrator.down(false).await.unwrap();
        assert!(sim.networks().contains("shared"));
    }
}
