// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use envo_core::models::Model;
use envo_core::services::allocator::HostCapacity;
use envo_core::services::loader::{load, LoadOptions};
use envo_core::services::orchestrator::Orchestrator;
use envo_core::services::runtime::Collaborators;
use envo_core::services::simulated::SimulatedRuntime;
use envo_core::services::state::StateStore;

/// Four cores and 8 GiB.
pub fn capacity() -> HostCapacity {
    HostCapacity {
        cpu_millis: 4000,
        memory_bytes: 8 << 30,
    }
}

pub fn model(yaml: &str) -> Model {
    load(yaml, &LoadOptions::default()).unwrap()
}

/// An orchestrator over a fresh simulated backend.
pub fn orchestrator(yaml: &str) -> (Orchestrator, Arc<SimulatedRuntime>) {
    let sim = Arc::new(SimulatedRuntime::new());
    (orchestrator_on(&sim, yaml), sim)
}

pub fn orchestrator_on(sim: &Arc<SimulatedRuntime>, yaml: &str) -> Orchestrator {
    Orchestrator::new(
        model(yaml),
        Collaborators::from_backend(sim.clone()),
        capacity(),
    )
    .unwrap()
}

/// An orchestrator persisting to `state_dir`, with earlier state loaded.
pub async fn persistent_orchestrator(
    sim: &Arc<SimulatedRuntime>,
    yaml: &str,
    state_dir: &Path,
) -> Orchestrator {
    let orchestrator = Orchestrator::with_store(
        model(yaml),
        Collaborators::from_backend(sim.clone()),
        capacity(),
        StateStore::new(state_dir),
    )
    .unwrap();
    orchestrator.load_state().await.unwrap();
    orchestrator
}

/// db <- cache <- api <- web, admin on db only.
pub const STACK: &str = r#"
name: shop
services:
  web:
    image: "nginx:1.27"
    depends_on: [api]
    ports: ["8080:80"]
  api:
    image: "shop/api:2"
    depends_on:
      db: { condition: service_healthy }
      cache: { condition: service_started }
    deploy:
      resources:
        reservations: { cpus: "1", memory: 1g }
  admin:
    image: "shop/admin:2"
    depends_on: [db]
  db:
    image: "postgres:16"
    volumes: ["pgdata:/var/lib/postgresql/data"]
    networks: [backend]
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
      timeout: 1s
      start_period: 10s
    deploy:
      resources:
        reservations: { cpus: "2", memory: 2g }
  cache:
    image: "redis:7"
    networks: [backend]
networks:
  backend: {}
volumes:
  pgdata: {}
"#;
