use std::collections::{BTreeMap, BTreeSet};

/// Networks and volumes a service holds a reference to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Holdings {
    networks: BTreeSet<String>,
    volumes: BTreeSet<String>,
}

/// Resources whose last reference was just dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
}

/// Reference counts of networks and volumes across services, plus the
/// runtime names this engine created (and therefore may remove).
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    held: BTreeMap<String, Holdings>,
    created_networks: BTreeSet<String>,
    created_volumes: BTreeSet<String>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the created sets from persisted state.
    pub fn with_created(
        networks: impl IntoIterator<Item = String>,
        volumes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            held: BTreeMap::new(),
            created_networks: networks.into_iter().collect(),
            created_volumes: volumes.into_iter().collect(),
        }
    }

    pub fn hold_network(&mut self, service: &str, network: &str) {
        self.held
            .entry(service.to_string())
            .or_default()
            .networks
            .insert(network.to_string());
    }

    pub fn hold_volume(&mut self, service: &str, volume: &str) {
        self.held
            .entry(service.to_string())
            .or_default()
            .volumes
            .insert(volume.to_string());
    }

    pub fn network_refs(&self, network: &str) -> usize {
        self.held
            .values()
            .filter(|h| h.networks.contains(network))
            .count()
    }

    pub fn volume_refs(&self, volume: &str) -> usize {
        self.held.values().filter(|h| h.volumes.contains(volume)).count()
    }

    /// Drop every reference `service` holds; returns what is now unreferenced.
    pub fn release(&mut self, service: &str) -> Released {
        let Some(holdings) = self.held.remove(service) else {
            return Released::default();
        };
        Released {
            networks: holdings
                .networks
                .into_iter()
                .filter(|n| self.network_refs(n) == 0)
                .collect(),
            volumes: holdings
                .volumes
                .into_iter()
                .filter(|v| self.volume_refs(v) == 0)
                .collect(),
        }
    }

    pub fn record_created_network(&mut self, runtime_name: &str) {
        self.created_networks.insert(runtime_name.to_string());
    }

    pub fn record_created_volume(&mut self, runtime_name: &str) {
        self.created_volumes.insert(runtime_name.to_string());
    }

    pub fn created_network(&self, runtime_name: &str) -> bool {
        self.created_networks.contains(runtime_name)
    }

    pub fn created_volume(&self, runtime_name: &str) -> bool {
        self.created_volumes.contains(runtime_name)
    }

    pub fn forget_network(&mut self, runtime_name: &str) {
        self.created_networks.remove(runtime_name);
    }

    pub fn forget_volume(&mut self, runtime_name: &str) {
        self.created_volumes.remove(runtime_name);
    }

    pub fn created_networks(&self) -> Vec<String> {
        self.created_networks.iter().cloned().collect()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.created_volumes.iter().cloned().collect()
    }
}
