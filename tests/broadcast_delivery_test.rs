//! Delivery of published versions to nodes and state clients

mod common;

use clusterctl::broadcast::{MemoryTransport, PushTarget};
use clusterctl::config::BroadcastConfig;
use clusterctl::coordination::MemoryCoordinationStore;
use clusterctl::state::StateReason;
use clusterctl::{HealthReport, Node, ReportOutcome, State};
use common::{config, controller, leading_controller, report_all, WINDOW};
use std::time::Duration;
use tokio::time::Instant;

fn fast_broadcast() -> BroadcastConfig {
    BroadcastConfig {
        push_timeout_ms: 100,
        max_retries: 1,
        retry_backoff_ms: 10,
        max_backoff_ms: 20,
        unreachable_threshold: 2,
    }
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_node_is_reported_down() {
    let (mut controller, _store, transport) =
        leading_controller(config("cc-a", 2).with_broadcast(fast_broadcast())).await;
    let unreachable = PushTarget::Node(Node::storage(1));
    transport.set_unreachable(unreachable.clone(), true).await;

    report_all(&mut controller, State::Up, 1);
    assert_eq!(controller.tick(Instant::now()).await.unwrap(), Some(1));

    // Three acks plus two failed rounds for the unreachable node
    let applied = controller
        .process_deliveries(5, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(applied, 5);
    assert_eq!(controller.metrics().synthetic_down_reports.get(), 1);
    // Each round is the first attempt plus one retry
    assert!(transport.attempts(&unreachable).await >= 4);

    let t0 = Instant::now();
    assert_eq!(controller.tick(t0).await.unwrap(), None);
    assert_eq!(controller.tick(t0 + WINDOW).await.unwrap(), Some(2));
    let bundle = controller.published().unwrap();
    assert_eq!(bundle.baseline.state.node_state(Node::storage(1)), State::Down);
    assert_eq!(bundle.baseline.reason(Node::storage(1)), Some(&StateReason::Unreachable));

    // Only a strictly newer report from the node replaces the synthetic down
    let same = HealthReport::new(Node::storage(1), State::Up, 1);
    assert_eq!(controller.report_health(same).unwrap(), ReportOutcome::Stale);
    let newer = HealthReport::new(Node::storage(1), State::Up, 2);
    assert_eq!(controller.report_health(newer).unwrap(), ReportOutcome::Applied);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_within_round() {
    let (mut controller, _store, transport) =
        leading_controller(config("cc-a", 1).with_broadcast(fast_broadcast())).await;
    let flaky = PushTarget::Node(Node::distributor(0));
    transport.fail_next(flaky.clone(), 1).await;

    report_all(&mut controller, State::Up, 1);
    controller.tick(Instant::now()).await.unwrap();
    let applied = controller
        .process_deliveries(2, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(applied, 2);
    assert_eq!(transport.versions_for(&flaky).await, vec![1]);
    assert_eq!(transport.attempts(&flaky).await, 2);
    assert_eq!(controller.metrics().deliveries_failed.get(), 0);
    assert_eq!(controller.status().acked_versions.get("distributor.0"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_newer_version_supersedes_pending_delivery() {
    let (mut controller, _store, transport) =
        leading_controller(config("cc-a", 2).with_broadcast(fast_broadcast())).await;
    let slow = PushTarget::Node(Node::storage(0));
    // Fails every attempt of the first round
    transport.fail_next(slow.clone(), 2).await;

    let t0 = Instant::now();
    report_all(&mut controller, State::Up, 1);
    assert_eq!(controller.tick(t0).await.unwrap(), Some(1));
    controller
        .set_wanted_state(Node::storage(1), State::Maintenance, "upgrade")
        .unwrap();
    assert_eq!(controller.tick(t0 + Duration::from_millis(500)).await.unwrap(), Some(2));

    controller
        .process_deliveries(16, Duration::from_secs(1))
        .await
        .unwrap();
    let delivered = transport.versions_for(&slow).await;
    // Version 1 was aborted before its retry round
    assert_eq!(delivered, vec![2]);
    assert_eq!(controller.status().acked_versions.get("storage.0"), Some(&2));
}

#[tokio::test]
async fn test_registered_client_receives_current_state() {
    let store = MemoryCoordinationStore::new();
    let transport = MemoryTransport::new();
    let mut controller = controller(config("cc-a", 2), &store, &transport);
    assert!(controller.acquire_leadership().await.unwrap());
    report_all(&mut controller, State::Up, 1);
    controller.tick(Instant::now()).await.unwrap();
    controller
        .process_deliveries(4, Duration::from_secs(5))
        .await
        .unwrap();

    // Registered after the publication: receives the current version
    controller.register_client("docproc");
    controller
        .process_deliveries(1, Duration::from_secs(5))
        .await
        .unwrap();
    let client = PushTarget::Client("docproc".into());
    assert_eq!(transport.versions_for(&client).await, vec![1]);
    assert_eq!(controller.status().acked_versions.get("client.docproc"), Some(&1));
}

#[tokio::test]
async fn test_standby_never_pushes() {
    let store = MemoryCoordinationStore::new();
    let transport = MemoryTransport::new();
    let mut leader = controller(config("cc-a", 2), &store, &transport);
    let mut standby = controller(config("cc-b", 2), &store, &transport);
    assert!(leader.acquire_leadership().await.unwrap());
    assert!(!standby.acquire_leadership().await.unwrap());

    report_all(&mut standby, State::Up, 1);
    standby.register_client("search");
    assert_eq!(standby.tick(Instant::now()).await.unwrap(), None);
    assert_eq!(
        standby
            .process_deliveries(1, Duration::from_millis(100))
            .await
            .unwrap(),
        0
    );
    assert!(transport.delivered().await.is_empty());
}
