use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle position of one service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    Pending,
    NetworkReady,
    ImageReady,
    Starting,
    HealthChecking,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        if next == Failed {
            return self != Stopped;
        }
        matches!(
            (self, next),
            (Pending, NetworkReady)
                | (NetworkReady, ImageReady)
                | (ImageReady, Starting)
                | (Starting, HealthChecking)
                | (HealthChecking, Running)
                | (HealthChecking, Degraded)
                | (Running, Degraded)
                | (Degraded, Running)
                // reconciler restarts
                | (Running, Starting)
                | (Degraded, Starting)
                | (Running, Stopping)
                | (Degraded, Stopping)
                | (Failed, Stopping)
                | (Stopping, Stopped)
                // launches abandoned by an earlier run
                | (Starting, Stopping)
                | (HealthChecking, Stopping)
                | (Starting, Stopped)
                // nothing was launched yet
                | (Pending, Stopped)
                | (NetworkReady, Stopped)
                | (ImageReady, Stopped)
                | (Failed, Stopped)
                | (Stopped, Pending)
        )
    }

    /// Between launch and the first health verdict.
    pub fn is_in_flight(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::HealthChecking)
    }

    /// Process is up and watched by the reconciler.
    pub fn is_up(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Degraded)
    }

    pub fn label(self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::NetworkReady => "network-ready",
            ServiceState::ImageReady => "image-ready",
            ServiceState::Starting => "starting",
            ServiceState::HealthChecking => "health-checking",
            ServiceState::Running => "running",
            ServiceState::Degraded => "degraded",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque reference to a fetched image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageHandle {
    pub reference: String,
    pub id: String,
}

/// Opaque reference to a launched process/container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntimeState {
    pub name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceRuntimeState {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: ServiceState::Pending,
            process: None,
            fingerprint: None,
            restart_count: 0,
            last_error: None,
            blocked_by: None,
            updated_at: Utc::now(),
            started_at: None,
        }
    }
}

/// Everything persisted between `envo` invocations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub project: String,
    pub services: Vec<ServiceRuntimeState>,
    /// Runtime names of networks this engine created (and may remove).
    #[serde(default)]
    pub created_networks: Vec<String>,
    /// Runtime names of volumes this engine created (and may remove).
    #[serde(default)]
    pub created_volumes: Vec<String>,
}

impl EnvironmentState {
    pub fn service(&self, name: &str) -> Option<&ServiceRuntimeState> {
        self.services.iter().find(|s| s.name == name)
    }
}
