use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::models::{CpuQuantity, MemoryQuantity, Model, Reservation};
use crate::services::graph::DependencyGraph;

/// Total cpu and memory the ledger may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapacity {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl HostCapacity {
    pub fn new(cpu: CpuQuantity, memory: MemoryQuantity) -> Self {
        Self {
            cpu_millis: cpu.millis(),
            memory_bytes: memory.bytes(),
        }
    }

    pub fn as_reservation(&self) -> Reservation {
        Reservation {
            cpu_millis: self.cpu_millis,
            memory_bytes: self.memory_bytes,
        }
    }
}

impl fmt::Display for HostCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.as_reservation(), f)
    }
}

/// Reservations held against a fixed capacity.
///
/// A plain value: passes clone it, mutate the clone and hand it back only
/// when everything fit. Invariant: `allocated() <= capacity` at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLedger {
    capacity: HostCapacity,
    reservations: BTreeMap<String, Reservation>,
}

impl ResourceLedger {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            capacity,
            reservations: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> HostCapacity {
        self.capacity
    }

    pub fn reservations(&self) -> &BTreeMap<String, Reservation> {
        &self.reservations
    }

    pub fn reservation(&self, service: &str) -> Option<Reservation> {
        self.reservations.get(service).copied()
    }

    pub fn allocated(&self) -> Reservation {
        self.reservations
            .values()
            .fold(Reservation::default(), |acc, r| Reservation {
                cpu_millis: acc.cpu_millis + r.cpu_millis,
                memory_bytes: acc.memory_bytes + r.memory_bytes,
            })
    }

    pub fn available(&self) -> Reservation {
        let allocated = self.allocated();
        Reservation {
            cpu_millis: self.capacity.cpu_millis.saturating_sub(allocated.cpu_millis),
            memory_bytes: self
                .capacity
                .memory_bytes
                .saturating_sub(allocated.memory_bytes),
        }
    }

    /// Reserve `amount` for `service`, replacing any earlier reservation it held.
    /// On failure the ledger is unchanged.
    pub fn reserve(&mut self, service: &str, amount: Reservation) -> Result<()> {
        let mut available = self.available();
        if let Some(previous) = self.reservations.get(service) {
            available.cpu_millis += previous.cpu_millis;
            available.memory_bytes += previous.memory_bytes;
        }
        if !amount.fits_within(&available) {
            return Err(OrchestratorError::InsufficientCapacity {
                service: service.to_string(),
                reason: format!("needs {amount}, {available} available"),
            });
        }
        self.reservations.insert(service.to_string(), amount);
        Ok(())
    }

    pub fn release(&mut self, service: &str) -> Option<Reservation> {
        self.reservations.remove(service)
    }
}

/// Reserve every service of `model` in topological order on a fresh ledger.
pub fn allocate(
    graph: &DependencyGraph,
    model: &Model,
    capacity: HostCapacity,
) -> Result<ResourceLedger> {
    allocate_onto(&ResourceLedger::new(capacity), graph, model)
}

/// All-or-nothing pass over an existing ledger. `base` is never modified;
/// the returned ledger holds `base` plus every service's reservation.
pub fn allocate_onto(
    base: &ResourceLedger,
    graph: &DependencyGraph,
    model: &Model,
) -> Result<ResourceLedger> {
    let mut ledger = base.clone();
    for name in graph.order() {
        let service = model
            .service(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.clone()))?;
        ledger.reserve(name, service.resources.reservation())?;
    }
    Ok(ledger)
}

/// Single serialized access point to the process-wide ledger.
pub struct ResourceAllocator {
    ledger: Mutex<ResourceLedger>,
}

impl ResourceAllocator {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            ledger: Mutex::new(ResourceLedger::new(capacity)),
        }
    }

    /// Run one allocation pass; commits only when every service fits.
    pub async fn allocate(&self, graph: &DependencyGraph, model: &Model) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        let next = allocate_onto(&ledger, graph, model)?;
        tracing::info!(
            allocated = %next.allocated(),
            capacity = %next.capacity(),
            "resources reserved"
        );
        *ledger = next;
        Ok(())
    }

    pub async fn release(&self, service: &str) -> Option<Reservation> {
        let released = self.ledger.lock().await.release(service);
        if let Some(amount) = released {
            tracing::debug!(service, %amount, "reservation released");
        }
        released
    }

    pub async fn snapshot(&self) -> ResourceLedger {
        self.ledger.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::loader::{load, LoadOptions};

    const GIB: u64 = 1 << 30;

    fn capacity(cores: u64, gib: u64) -> HostCapacity {
        HostCapacity {
            cpu_millis: cores * 1000,
            memory_bytes: gib * GIB,
        }
    }

    fn model() -> Model {
        load(
            r#"
services:
  db:
    image: postgres
    deploy: { resources: { reservations: { cpus: 1, memory: 2g } } }
  app:
    image: app
    depends_on: [db]
    deploy: { resources: { reservations: { cpus: "500m", memory: 1g }, limits: { cpus: 4 } } }
  tools:
    image: busybox
"#,
            &LoadOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn reserves_in_topological_order() {
        let model = model();
        let graph = DependencyGraph::build(&model).unwrap();
        let ledger = allocate(&graph, &model, capacity(4, 8)).unwrap();
        assert_eq!(
            ledger.allocated(),
            Reservation {
                cpu_millis: 1500,
                memory_bytes: 3 * GIB
            }
        );
        assert_eq!(ledger.available().cpu_millis, 2500);
        assert!(ledger.reservation("tools").unwrap().is_zero());
    }

    #[test]
    fn limits_are_not_consumed() {
        let model = model();
        let graph = DependencyGraph::build(&model).unwrap();
        // app's 4-core limit exceeds what is left, but only reservations count.
        let ledger = allocate(&graph, &model, capacity(2, 4)).unwrap();
        assert_eq!(ledger.available().cpu_millis, 500);
    }

    #[test]
    fn failure_names_first_unsatisfiable_service_and_leaves_ledger_untouched() {
        let model = model();
        let graph = DependencyGraph::build(&model).unwrap();
        let mut base = ResourceLedger::new(capacity(4, 4));
        base.reserve("external", Reservation {
            cpu_millis: 0,
            memory_bytes: GIB + GIB / 2,
        })
        .unwrap();
        let before = base.clone();

        let err = allocate_onto(&base, &graph, &model).unwrap_err();
        match err {
            OrchestratorError::InsufficientCapacity { service, .. } => assert_eq!(service, "app"),
            other => panic!("expected InsufficientCapacity, got {other}"),
        }
        assert_eq!(base, before);
    }

    #[test]
    fn reserve_replaces_previous_reservation() {
        let mut ledger = ResourceLedger::new(capacity(1, 1));
        let half = Reservation {
            cpu_millis: 500,
            memory_bytes: GIB / 2,
        };
        ledger.reserve("a", half).unwrap();
        ledger.reserve("a", capacity(1, 1).as_reservation()).unwrap();
        assert_eq!(ledger.available(), Reservation::default());
        assert!(ledger.reserve("b", half).is_err());
        assert_eq!(ledger.release("a"), Some(capacity(1, 1).as_reservation()));
        ledger.reserve("b", half).unwrap();
    }

    #[tokio::test]
    async fn allocator_commits_only_successful_passes() {
        let model = model();
        let graph = DependencyGraph::build(&model).unwrap();

        let allocator = ResourceAllocator::new(capacity(1, 8));
        assert!(allocator.allocate(&graph, &model).await.is_err());
        assert!(allocator.snapshot().await.reservations().is_empty());

        let allocator = ResourceAllocator::new(capacity(4, 8));
        allocator.allocate(&graph, &model).await.unwrap();
        assert_eq!(allocator.snapshot().await.reservations().len(), 3);
        let released = allocator.release("db").await.unwrap();
        assert_eq!(released.cpu_millis, 1000);
        assert_eq!(allocator.snapshot().await.allocated().cpu_millis, 500);
    }
}
