use std::collections::{BTreeMap, VecDeque};
use std::future::Future;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::models::config::ReconcileConfig;
use crate::models::ServiceState;
use crate::services::orchestrator::{condition_satisfied, probe_once, Orchestrator};

/// What one pass did to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    MarkedDegraded(String),
    Recovered(String),
    Restarted(String),
    /// Restart due, but a predecessor no longer meets its condition.
    RestartDeferred(String),
    RestartFailed(String),
    Exhausted(String),
}

#[derive(Debug, Default)]
struct Tracker {
    consecutive_failures: u32,
    restarts: VecDeque<Instant>,
}

/// Watches up services after `up` and restarts the ones that stay unhealthy.
///
/// A service restarts after `failure_threshold` consecutive failed probes.
/// More than `max_restarts` restarts inside `window` marks it Failed.
pub struct Reconciler {
    orchestrator: Orchestrator,
    config: ReconcileConfig,
    trackers: BTreeMap<String, Tracker>,
}

impl Reconciler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let config = orchestrator.model().engine.reconcile.clone();
        Self {
            orchestrator,
            config,
            trackers: BTreeMap::new(),
        }
    }

    /// Restarts counted against `service` in the current window.
    pub fn restarts(&self, service: &str) -> usize {
        self.trackers
            .get(service)
            .map_or(0, |t| t.restarts.len())
    }

    /// Run passes on `reconcile.interval` until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; services were just checked by `up`.
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::debug!("reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    for action in self.reconcile_pass().await {
                        tracing::debug!(?action, "reconcile");
                    }
                }
            }
        }
    }

    pub async fn reconcile_pass(&mut self) -> Vec<ReconcileAction> {
        self.reconcile_pass_at(Instant::now()).await
    }

    /// One pass over every up service, in dependency order. Every service is
    /// probed before any restart begins; due restarts then run concurrently
    /// and the pass returns once the slowest has settled.
    pub async fn reconcile_pass_at(&mut self, now: Instant) -> Vec<ReconcileAction> {
        let mut actions = Vec::new();
        let mut due = Vec::new();
        let order = self.orchestrator.graph().order().to_vec();

        for name in order {
            let Some(record) = self.orchestrator.record(&name) else {
                continue;
            };
            if !record.state.is_up() {
                self.trackers.remove(&name);
                continue;
            }
            let Some(process) = record.process.clone() else {
                continue;
            };
            let Some(service) = self.orchestrator.model().service(&name) else {
                continue;
            };

            let collaborators = self.orchestrator.collaborators();
            let alive = matches!(
                tokio::time::timeout(
                    service.healthcheck.timeout,
                    collaborators.runtime.is_running(&process)
                )
                .await,
                Ok(Ok(true))
            );
            let healthy = alive
                && probe_once(collaborators.probe.as_ref(), &process, &service.healthcheck).await;

            if healthy {
                self.trackers.entry(name.clone()).or_default().consecutive_failures = 0;
                if record.state == ServiceState::Degraded {
                    match self.orchestrator.set_health(&name, true).await {
                        Ok(()) => {
                            tracing::info!(service = %name, "recovered");
                            actions.push(ReconcileAction::Recovered(name));
                        }
                        Err(e) => tracing::warn!(service = %name, error = %e, "could not mark recovered"),
                    }
                }
                continue;
            }

            let failures = {
                let tracker = self.trackers.entry(name.clone()).or_default();
                tracker.consecutive_failures += 1;
                tracker.consecutive_failures
            };
            tracing::debug!(service = %name, failures, alive, "probe failed");

            if record.state == ServiceState::Running {
                match self.orchestrator.set_health(&name, false).await {
                    Ok(()) => {
                        tracing::warn!(service = %name, "unhealthy, marked degraded");
                        actions.push(ReconcileAction::MarkedDegraded(name.clone()));
                    }
                    Err(e) => tracing::warn!(service = %name, error = %e, "could not mark degraded"),
                }
            }

            if failures >= self.config.failure_threshold {
                due.push(name);
            }
        }

        let mut restarts = JoinSet::new();
        let mut restarting = Vec::new();
        for name in due {
            if let Some(action) = self.charge_restart(&name, now).await {
                actions.push(action);
                continue;
            }
            let orchestrator = self.orchestrator.clone();
            restarting.push(name.clone());
            restarts.spawn(async move {
                let result = orchestrator.restart_service(&name).await;
                (name, result)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = restarts.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    outcomes.insert(name.clone(), ReconcileAction::Restarted(name));
                }
                Ok((name, Err(e))) => {
                    tracing::error!(service = %name, error = %e, "restart failed");
                    outcomes.insert(name.clone(), ReconcileAction::RestartFailed(name));
                }
                Err(e) => tracing::error!(error = %e, "restart task aborted"),
            }
        }
        actions.extend(restarting.iter().filter_map(|name| outcomes.remove(name)));

        actions
    }

    /// Count a due restart against the window. `None` means go ahead;
    /// otherwise the service was given up on or has to wait.
    async fn charge_restart(&mut self, name: &str, now: Instant) -> Option<ReconcileAction> {
        let window = self.config.window;
        let max_restarts = self.config.max_restarts;
        let blocker = self.unmet_predecessor(name);
        let tracker = self.trackers.entry(name.to_string()).or_default();
        while tracker
            .restarts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            tracker.restarts.pop_front();
        }

        if tracker.restarts.len() as u32 >= max_restarts {
            let restarts = tracker.restarts.len() as u32;
            self.trackers.remove(name);
            self.orchestrator
                .mark_exhausted(name, restarts, window)
                .await;
            return Some(ReconcileAction::Exhausted(name.to_string()));
        }

        if let Some(blocker) = blocker {
            tracing::info!(service = name, waiting_on = %blocker, "restart deferred");
            return Some(ReconcileAction::RestartDeferred(name.to_string()));
        }

        tracker.restarts.push_back(now);
        tracker.consecutive_failures = 0;
        tracing::warn!(service = name, attempt = tracker.restarts.len(), "restarting");
        None
    }

    fn unmet_predecessor(&self, name: &str) -> Option<String> {
        let graph = self.orchestrator.graph();
        graph
            .predecessors(name)
            .into_iter()
            .find(|p| {
                let Some(condition) = graph.condition(name, p) else {
                    return false;
                };
                self.orchestrator
                    .record(p)
                    .map_or(true, |r| !condition_satisfied(&r, condition))
            })
            .map(str::to_string)
    }
}
