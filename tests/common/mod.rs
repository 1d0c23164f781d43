//! Shared helpers for controller integration tests

#![allow(dead_code)]

use clusterctl::broadcast::{MemoryTransport, StateTransport};
use clusterctl::config::{
    CoordinationConfig, FleetTopology, GenerationPolicy, TransitionPolicy,
};
use clusterctl::coordination::{CoordinationStore, MemoryCoordinationStore};
use clusterctl::{Controller, ControllerConfig, HealthReport, Node, State};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const WINDOW: Duration = Duration::from_secs(2);

/// Fleet of `nodes` nodes in one group with a short stabilization window
/// and a lease that never expires during a test
pub fn config(id: &str, nodes: usize) -> ControllerConfig {
    ControllerConfig::new(id, FleetTopology::flat(nodes))
        .with_transition(TransitionPolicy {
            stabilization_window_ms: WINDOW.as_millis() as u64,
            min_publication_interval_ms: 100,
            up_confirmation_reports: 1,
        })
        .with_coordination(CoordinationConfig {
            lease_ttl_ms: 600_000,
            ..Default::default()
        })
}

pub fn with_group_ratio(config: ControllerConfig, ratio: f64) -> ControllerConfig {
    config.with_policy(GenerationPolicy {
        min_node_ratio_per_group: ratio,
        ..Default::default()
    })
}

pub fn controller(
    config: ControllerConfig,
    store: &MemoryCoordinationStore,
    transport: &MemoryTransport,
) -> Controller {
    let store: Arc<dyn CoordinationStore> = Arc::new(store.clone_client());
    let transport: Arc<dyn StateTransport> = Arc::new(transport.clone());
    Controller::new(config, store, transport).expect("valid test configuration")
}

/// A controller that already holds the lease
pub async fn leading_controller(config: ControllerConfig) -> (Controller, MemoryCoordinationStore, MemoryTransport) {
    let store = MemoryCoordinationStore::new();
    let transport = MemoryTransport::new();
    let mut controller = controller(config, &store, &transport);
    assert!(controller.acquire_leadership().await.unwrap());
    (controller, store, transport)
}

pub fn report(controller: &mut Controller, node: Node, state: State, timestamp_ms: u64) {
    controller
        .report_health(HealthReport::new(node, state, timestamp_ms))
        .unwrap();
}

pub fn report_all(controller: &mut Controller, state: State, timestamp_ms: u64) {
    let nodes: Vec<Node> = controller.registry().nodes().collect();
    for node in nodes {
        report(controller, node, state, timestamp_ms);
    }
}

pub fn after(start: Instant, millis: u64) -> Instant {
    start + Duration::from_millis(millis)
}
