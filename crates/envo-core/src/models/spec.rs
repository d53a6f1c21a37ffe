use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use super::config::EngineConfig;
use super::quantity::{duration_str, CpuQuantity, MemoryQuantity};

/// Name of the network a service joins when it declares none.
pub const DEFAULT_NETWORK: &str = "default";

/// A validated environment: what `up` should realize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub project: String,
    pub services: BTreeMap<String, ServiceSpec>,
    pub networks: BTreeMap<String, NetworkSpec>,
    pub volumes: BTreeMap<String, VolumeSpec>,
    pub engine: EngineConfig,
}

impl Model {
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Runtime name of a container: `<project>-<service>`.
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.project, service)
    }

    /// Runtime name of a network; external networks keep their declared name.
    pub fn network_runtime_name(&self, network: &str) -> String {
        match self.networks.get(network) {
            Some(n) if n.external => n.name.clone(),
            _ => format!("{}_{}", self.project, network),
        }
    }

    /// Runtime name of a volume; external volumes keep their declared name.
    pub fn volume_runtime_name(&self, volume: &str) -> String {
        match self.volumes.get(volume) {
            Some(v) if v.external => v.name.clone(),
            _ => format!("{}_{}", self.project, volume),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub resources: ResourceRequest,
    pub networks: BTreeSet<String>,
    pub depends_on: BTreeMap<String, DependencyCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub healthcheck: HealthCheck,
}

impl ServiceSpec {
    /// Named volumes this service mounts (bind mounts excluded).
    pub fn named_volumes(&self) -> impl Iterator<Item = &str> {
        self.volumes.iter().filter_map(|v| match &v.source {
            VolumeSource::Named(name) => Some(name.as_str()),
            VolumeSource::Bind(_) => None,
        })
    }

    /// Stable digest of the desired state, used to decide adopt vs recreate.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha3_256::digest(&encoded))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{ip}:")?;
        }
        write!(f, "{}:{}", self.host, self.container)?;
        if self.protocol == Protocol::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum VolumeSource {
    Named(String),
    Bind(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBinding {
    pub source: VolumeSource,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<CpuQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_reservation: Option<CpuQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<MemoryQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<MemoryQuantity>,
}

impl ResourceRequest {
    /// What the ledger consumes for this service; missing reservations count as zero.
    pub fn reservation(&self) -> Reservation {
        Reservation {
            cpu_millis: self.cpu_reservation.map(CpuQuantity::millis).unwrap_or(0),
            memory_bytes: self.memory_reservation.map(MemoryQuantity::bytes).unwrap_or(0),
        }
    }
}

/// An amount of cpu and memory held in the resource ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Reservation {
    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }

    pub fn fits_within(&self, available: &Reservation) -> bool {
        self.cpu_millis <= available.cpu_millis && self.memory_bytes <= available.memory_bytes
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={}",
            CpuQuantity(self.cpu_millis),
            MemoryQuantity(self.memory_bytes)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// The dependency has been launched (HealthChecking or later, not failed).
    #[default]
    ServiceStarted,
    /// The dependency passed its health check.
    ServiceHealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ProbeKind {
    /// Healthy while the process exists.
    Running,
    /// Command executed inside the container; exit 0 is healthy.
    Command { argv: Vec<String> },
    /// TCP connect to a host-side port.
    Tcp { host: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub probe: ProbeKind,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Bound on a single probe.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Deadline for HealthChecking before the service is marked Degraded.
    #[serde(with = "duration_str")]
    pub start_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: String,
    pub external: bool,
}
