use std::collections::BTreeMap;

use serde::Serialize;

use super::state::ServiceState;

/// Final position of one service after an `up` run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOutcome {
    pub name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Predecessor whose failure kept this service from starting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// A failed service and every service it transitively blocked.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureChain {
    pub root: String,
    pub error: String,
    /// Each blocked service with the predecessor it waited on.
    pub blocked: Vec<(String, String)>,
}

impl FailureChain {
    pub fn describe(&self) -> String {
        let mut out = format!("service '{}' failed: {}", self.root, self.error);
        for (service, waited_on) in &self.blocked {
            out.push_str(&format!("\n  '{service}' blocked by '{waited_on}'"));
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Outcomes in topological order.
    pub services: Vec<ServiceOutcome>,
}

impl RunReport {
    pub fn outcome(&self, name: &str) -> Option<&ServiceOutcome> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn all_running(&self) -> bool {
        self.services.iter().all(|s| s.state == ServiceState::Running)
    }

    pub fn degraded(&self) -> Vec<&ServiceOutcome> {
        self.services
            .iter()
            .filter(|s| s.state == ServiceState::Degraded)
            .collect()
    }

    /// One chain per failed service, in topological order of the roots.
    pub fn failures(&self) -> Vec<FailureChain> {
        let by_name: BTreeMap<&str, &ServiceOutcome> =
            self.services.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut chains: Vec<FailureChain> = self
            .services
            .iter()
            .filter(|s| s.state == ServiceState::Failed)
            .map(|s| FailureChain {
                root: s.name.clone(),
                error: s.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                blocked: Vec::new(),
            })
            .collect();

        for outcome in &self.services {
            let Some(waited_on) = outcome.blocked_by.as_deref() else {
                continue;
            };
            // Follow blocked_by links until reaching the service that actually failed.
            let mut cursor = waited_on;
            let mut hops = 0;
            while let Some(next) = by_name.get(cursor).and_then(|o| o.blocked_by.as_deref()) {
                cursor = next;
                hops += 1;
                if hops > self.services.len() {
                    break;
                }
            }
            let entry = (outcome.name.clone(), waited_on.to_string());
            match chains.iter_mut().find(|c| c.root == cursor) {
                Some(chain) => chain.blocked.push(entry),
                // Root did not fail but never satisfied the condition (e.g. degraded).
                None => {
                    let root = by_name.get(cursor);
                    chains.push(FailureChain {
                        root: cursor.to_string(),
                        error: root
                            .and_then(|o| o.error.clone())
                            .or_else(|| root.map(|o| format!("ended {}", o.state)))
                            .unwrap_or_else(|| "unknown error".to_string()),
                        blocked: vec![entry],
                    });
                }
            }
        }

        chains
    }

    /// Process exit code for `up`: 0 all running, 2 degraded only, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_running() {
            0
        } else if self
            .services
            .iter()
            .all(|s| s.state.is_up())
        {
            2
        } else {
            1
        }
    }
}

/// Result of a `down` run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownReport {
    /// Services in the order they reached Stopped.
    pub stopped: Vec<String>,
    /// Services whose teardown failed, with the error.
    pub failed: Vec<(String, String)>,
    pub removed_networks: Vec<String>,
    pub removed_volumes: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
