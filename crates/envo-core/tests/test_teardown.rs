mod common;

use std::time::Duration;

use envo_core::models::ServiceState;
use envo_core::services::simulated::RuntimeEvent;

use common::{orchestrator, STACK};

#[tokio::test(start_paused = true)]
async fn dependents_stop_before_their_dependencies() {
    let (orchestrator, sim) = orchestrator(STACK);
    assert!(orchestrator.up().await.unwrap().all_running());

    let report = orchestrator.down(false).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.stopped.len(), 5);

    let stopped = |name: &str| sim.position(&RuntimeEvent::Stopped(name.into())).unwrap();
    assert!(stopped("web") < stopped("api"));
    assert!(stopped("api") < stopped("db"));
    assert!(stopped("api") < stopped("cache"));
    assert!(stopped("admin") < stopped("db"));

    assert!(sim.running_services().is_empty());
    assert!(orchestrator
        .snapshot()
        .iter()
        .all(|r| r.state == ServiceState::Stopped && r.process.is_none()));
    assert!(orchestrator.ledger().await.reservations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn created_networks_and_volumes_are_removed() {
    let (orchestrator, sim) = orchestrator(STACK);
    orchestrator.up().await.unwrap();

    let report = orchestrator.down(false).await.unwrap();
    assert!(sim.networks().is_empty());
    assert!(sim.volumes().is_empty());
    assert!(report.removed_networks.contains(&"shop_backend".to_string()));
    assert_eq!(report.removed_volumes, ["shop_pgdata"]);

    // backend is shared by db and cache; it goes only after both stopped.
    let removed = sim
        .position(&RuntimeEvent::NetworkRemoved("shop_backend".into()))
        .unwrap();
    assert!(sim.position(&RuntimeEvent::Stopped("db".into())).unwrap() < removed);
    assert!(sim.position(&RuntimeEvent::Stopped("cache".into())).unwrap() < removed);
}

#[tokio::test(start_paused = true)]
async fn keep_volumes_leaves_data_behind() {
    let (orchestrator, sim) = orchestrator(STACK);
    orchestrator.up().await.unwrap();

    let report = orchestrator.down(true).await.unwrap();
    assert!(report.removed_volumes.is_empty());
    assert!(sim.volumes().contains("shop_pgdata"));
    assert!(sim.networks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pre_existing_resources_are_left_alone() {
    let (orchestrator, sim) = orchestrator(STACK);
    sim.add_volume("shop_pgdata");
    orchestrator.up().await.unwrap();

    let report = orchestrator.down(false).await.unwrap();
    assert!(report.removed_volumes.is_empty());
    assert!(sim.volumes().contains("shop_pgdata"));
}

#[tokio::test(start_paused = true)]
async fn partial_up_tears_down_cleanly() {
    let (orchestrator, sim) = orchestrator(STACK);
    sim.fail_start("cache", "port in use");
    let report = orchestrator.up().await.unwrap();
    assert_eq!(report.outcome("cache").unwrap().state, ServiceState::Failed);
    assert_eq!(report.outcome("api").unwrap().state, ServiceState::NetworkReady);

    let teardown = orchestrator.down(false).await.unwrap();
    assert!(teardown.is_clean(), "{teardown:?}");
    assert!(sim.running_services().is_empty());
    assert!(orchestrator
        .snapshot()
        .iter()
        .all(|r| r.state == ServiceState::Stopped));
}

const SLOW_DB: &str = r#"
name: slow
services:
  db:
    image: "postgres:16"
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 1s
      timeout: 1s
      start_period: 30s
  api:
    image: "shop/api:2"
    depends_on: [db]
"#;

#[tokio::test(start_paused = true)]
async fn teardown_waits_for_a_launch_in_flight() {
    let (orchestrator, sim) = orchestrator(SLOW_DB);
    sim.delay_start("db", Duration::from_secs(5));
    sim.unhealthy_for("db", 3);

    let down = async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(orchestrator.state_of("db"), Some(ServiceState::Starting));
        orchestrator.down(false).await
    };
    let (up, down) = tokio::join!(orchestrator.up(), down);
    up.unwrap();
    let report = down.unwrap();
    assert!(report.is_clean(), "{report:?}");

    let events = sim.events();
    let stopped = |name: &str| sim.position(&RuntimeEvent::Stopped(name.into())).unwrap();
    assert!(stopped("api") < stopped("db"));
    // three failed probes, then the healthy one, all before the stop
    let probes_before_stop = events[..stopped("db")]
        .iter()
        .filter(|e| **e == RuntimeEvent::Probed("db".into()))
        .count();
    assert_eq!(probes_before_stop, 4);
    assert_eq!(orchestrator.state_of("db"), Some(ServiceState::Stopped));
    assert!(sim.running_services().is_empty());
}
