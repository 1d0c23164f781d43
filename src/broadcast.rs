//! Broadcast dispatcher.
//!
//! Pushes each published bundle to every node and registered client. Every
//! target gets its own delivery task so a slow or dead node never delays
//! the others. A new version aborts deliveries still in flight for the old
//! one, and losing leadership aborts everything.

use crate::config::BroadcastConfig;
use crate::coordination::LeaderCoordinator;
use crate::error::{ControllerError, Result};
use crate::state::{ClusterStateBundle, Node};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiver of published state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PushTarget {
    Node(Node),
    /// A registered state consumer, identified by name
    Client(String),
}

impl fmt::Display for PushTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(node) => write!(f, "{}", node),
            Self::Client(id) => write!(f, "client.{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Ack,
    Nack(String),
}

/// Delivery mechanism for cluster state bundles
#[async_trait]
pub trait StateTransport: Send + Sync + 'static {
    async fn push(&self, target: &PushTarget, bundle: Arc<ClusterStateBundle>)
        -> Result<PushOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked { attempts: u32 },
    /// A full round of attempts failed; the task keeps retrying
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub target: PushTarget,
    pub version: u64,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStatus {
    pub acked_version: Option<u64>,
    pub consecutive_failures: u32,
}

pub struct BroadcastDispatcher {
    transport: Arc<dyn StateTransport>,
    config: BroadcastConfig,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    in_flight: HashMap<PushTarget, JoinHandle<()>>,
    latest_version: u64,
    targets: BTreeMap<PushTarget, TargetStatus>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher and the channel on which delivery reports arrive
    pub fn new(
        transport: Arc<dyn StateTransport>,
        config: BroadcastConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryReport>) {
        let (reports, receiver) = mpsc::unbounded_channel();
        let dispatcher = Self {
            transport,
            config,
            reports,
            in_flight: HashMap::new(),
            latest_version: 0,
            targets: BTreeMap::new(),
        };
        (dispatcher, receiver)
    }

    pub fn latest_version(&self) -> u64 {
        self.latest_version
    }

    pub fn status(&self, target: &PushTarget) -> Option<TargetStatus> {
        self.targets.get(target).copied()
    }

    /// Latest acknowledged version per target
    pub fn acked_versions(&self) -> BTreeMap<String, u64> {
        self.targets
            .iter()
            .filter_map(|(target, status)| status.acked_version.map(|v| (target.to_string(), v)))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.values().filter(|h| !h.is_finished()).count()
    }

    /// Start delivering `bundle` to every target, superseding older
    /// deliveries
    pub fn dispatch(
        &mut self,
        bundle: Arc<ClusterStateBundle>,
        targets: &[PushTarget],
        leader: &Arc<LeaderCoordinator>,
    ) -> Result<()> {
        if !leader.can_publish(tokio::time::Instant::now()) {
            return Err(ControllerError::NotLeader);
        }
        if bundle.version < self.latest_version {
            return Err(ControllerError::InvariantViolation(format!(
                "dispatch of version {} after version {}",
                bundle.version, self.latest_version
            )));
        }
        self.cancel_all();
        self.latest_version = bundle.version;

        let wanted: HashSet<&PushTarget> = targets.iter().collect();
        self.targets.retain(|target, _| wanted.contains(target));
        for target in targets {
            self.spawn_delivery(target.clone(), Arc::clone(&bundle), leader);
        }
        info!(
            version = bundle.version,
            targets = targets.len(),
            "dispatching cluster state"
        );
        Ok(())
    }

    /// Deliver the latest bundle to one target without touching the others
    pub fn dispatch_one(
        &mut self,
        bundle: Arc<ClusterStateBundle>,
        target: PushTarget,
        leader: &Arc<LeaderCoordinator>,
    ) -> Result<()> {
        if !leader.can_publish(tokio::time::Instant::now()) {
            return Err(ControllerError::NotLeader);
        }
        if bundle.version != self.latest_version {
            return Err(ControllerError::InvariantViolation(format!(
                "single delivery of version {} while version {} is current",
                bundle.version, self.latest_version
            )));
        }
        if let Some(handle) = self.in_flight.remove(&target) {
            handle.abort();
        }
        self.spawn_delivery(target, bundle, leader);
        Ok(())
    }

    fn spawn_delivery(
        &mut self,
        target: PushTarget,
        bundle: Arc<ClusterStateBundle>,
        leader: &Arc<LeaderCoordinator>,
    ) {
        self.targets.entry(target.clone()).or_default();
        let task = deliver(
            Arc::clone(&self.transport),
            target.clone(),
            bundle,
            self.config.clone(),
            Arc::clone(leader),
            self.reports.clone(),
        );
        self.in_flight.insert(target, tokio::spawn(task));
    }

    /// Fold a delivery report into the per-target status. Returns the node
    /// to mark unreachable when it crosses the failure threshold.
    pub fn apply_report(&mut self, report: &DeliveryReport) -> Option<Node> {
        if report.version < self.latest_version {
            debug!(
                recipient = %report.target,
                version = report.version,
                latest = self.latest_version,
                "discarding report for superseded version"
            );
            return None;
        }
        let status = self.targets.get_mut(&report.target)?;
        match &report.outcome {
            DeliveryOutcome::Acked { attempts } => {
                debug!(recipient = %report.target, version = report.version, attempts, "delivery acknowledged");
                status.acked_version = Some(report.version);
                status.consecutive_failures = 0;
                self.in_flight.remove(&report.target);
                None
            }
            DeliveryOutcome::Failed { attempts, error } => {
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                warn!(
                    recipient = %report.target,
                    version = report.version,
                    attempts,
                    failures = status.consecutive_failures,
                    %error,
                    "delivery failed"
                );
                match &report.target {
                    PushTarget::Node(node)
                        if status.consecutive_failures >= self.config.unreachable_threshold =>
                    {
                        Some(*node)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Abort every delivery in flight
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
        }
    }
}

impl Drop for BroadcastDispatcher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn backoff_delay(config: &BroadcastConfig, retry: u32) -> Duration {
    let base = config
        .retry_backoff()
        .saturating_mul(2u32.saturating_pow(retry))
        .min(config.max_backoff());
    let jitter_ms = (base.as_millis() as u64) / 4;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Push `bundle` to one target until it is acknowledged, the task is
/// aborted by a newer version, or the lease no longer allows publishing
async fn deliver(
    transport: Arc<dyn StateTransport>,
    target: PushTarget,
    bundle: Arc<ClusterStateBundle>,
    config: BroadcastConfig,
    leader: Arc<LeaderCoordinator>,
    reports: mpsc::UnboundedSender<DeliveryReport>,
) {
    let attempts_per_round = config.max_retries.saturating_add(1);
    loop {
        let mut error = String::new();
        for attempt in 0..attempts_per_round {
            if !leader.can_publish(tokio::time::Instant::now()) {
                debug!(recipient = %target, "lease not valid, delivery stopped");
                return;
            }
            let push = transport.push(&target, Arc::clone(&bundle));
            error = match tokio::time::timeout(config.push_timeout(), push).await {
                Ok(Ok(PushOutcome::Ack)) => {
                    let _ = reports.send(DeliveryReport {
                        target: target.clone(),
                        version: bundle.version,
                        outcome: DeliveryOutcome::Acked {
                            attempts: attempt + 1,
                        },
                    });
                    return;
                }
                Ok(Ok(PushOutcome::Nack(reason))) => format!("rejected: {}", reason),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no answer within {:?}", config.push_timeout()),
            };
            if attempt + 1 < attempts_per_round {
                tokio::time::sleep(backoff_delay(&config, attempt)).await;
            }
        }

        let report = DeliveryReport {
            target: target.clone(),
            version: bundle.version,
            outcome: DeliveryOutcome::Failed {
                attempts: attempts_per_round,
                error,
            },
        };
        if reports.send(report).is_err() {
            return;
        }
        tokio::time::sleep(config.max_backoff()).await;
    }
}

/// Transport that logs every bundle and acknowledges it
#[derive(Debug, Default)]
pub struct LoggingTransport;

#[async_trait]
impl StateTransport for LoggingTransport {
    async fn push(
        &self,
        target: &PushTarget,
        bundle: Arc<ClusterStateBundle>,
    ) -> Result<PushOutcome> {
        info!(recipient = %target, version = bundle.version, state = %bundle, "cluster state pushed");
        Ok(PushOutcome::Ack)
    }
}

#[derive(Debug, Default)]
struct MemoryTransportState {
    delivered: Vec<(PushTarget, u64)>,
    fail_next: HashMap<PushTarget, u32>,
    unreachable: HashSet<PushTarget>,
    attempts: HashMap<PushTarget, u32>,
}

/// In-process transport recording deliveries, with scriptable failures
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryTransportState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` pushes to `target`
    pub async fn fail_next(&self, target: PushTarget, count: u32) {
        self.state.lock().await.fail_next.insert(target, count);
    }

    pub async fn set_unreachable(&self, target: PushTarget, unreachable: bool) {
        let mut state = self.state.lock().await;
        if unreachable {
            state.unreachable.insert(target);
        } else {
            state.unreachable.remove(&target);
        }
    }

    /// Every successful delivery in order
    pub async fn delivered(&self) -> Vec<(PushTarget, u64)> {
        self.state.lock().await.delivered.clone()
    }

    /// Versions delivered to one target in order
    pub async fn versions_for(&self, target: &PushTarget) -> Vec<u64> {
        self.state
            .lock()
            .await
            .delivered
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, v)| *v)
            .collect()
    }

    pub async fn attempts(&self, target: &PushTarget) -> u32 {
        self.state
            .lock()
            .await
            .attempts
            .get(target)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateTransport for MemoryTransport {
    async fn push(
        &self,
        target: &PushTarget,
        bundle: Arc<ClusterStateBundle>,
    ) -> Result<PushOutcome> {
        let mut state = self.state.lock().await;
        *state.attempts.entry(target.clone()).or_insert(0) += 1;
        if state.unreachable.contains(target) {
            return Err(ControllerError::Timeout(format!("{} unreachable", target)));
        }
        if let Some(remaining) = state.fail_next.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(PushOutcome::Nack("scripted failure".to_string()));
            }
        }
        state.delivered.push((target.clone(), bundle.version));
        Ok(PushOutcome::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::coordination::MemoryCoordinationStore;
    use crate::state::make_bundle;

    async fn leader() -> Arc<LeaderCoordinator> {
        let coordinator = LeaderCoordinator::new(
            "a",
            Arc::new(MemoryCoordinationStore::new()),
            CoordinationConfig {
                lease_ttl_ms: 600_000,
                ..Default::default()
            },
        );
        coordinator.try_acquire().await.unwrap();
        Arc::new(coordinator)
    }

    fn config() -> BroadcastConfig {
        BroadcastConfig {
            push_timeout_ms: 100,
            max_retries: 2,
            retry_backoff_ms: 10,
            max_backoff_ms: 40,
            unreachable_threshold: 2,
        }
    }

    fn bundle(version: u64) -> Arc<ClusterStateBundle> {
        Arc::new(make_bundle("distributor:2 storage:2", &[]).with_version(version, 0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_to_all_targets() {
        let transport = MemoryTransport::new();
        let (mut dispatcher, mut reports) =
            BroadcastDispatcher::new(Arc::new(transport.clone()), config());
        let leader = leader().await;
        let targets = vec![
            PushTarget::Node(Node::storage(0)),
            PushTarget::Node(Node::distributor(0)),
            PushTarget::Client("search".into()),
        ];
        dispatcher.dispatch(bundle(1), &targets, &leader).unwrap();
        for _ in 0..3 {
            let report = reports.recv().await.unwrap();
            assert_eq!(report.outcome, DeliveryOutcome::Acked { attempts: 1 });
            assert_eq!(dispatcher.apply_report(&report), None);
        }
        assert_eq!(dispatcher.acked_versions().len(), 3);
        assert_eq!(transport.delivered().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_acked() {
        let transport = MemoryTransport::new();
        let target = PushTarget::Node(Node::storage(1));
        transport.fail_next(target.clone(), 2).await;
        let (mut dispatcher, mut reports) =
            BroadcastDispatcher::new(Arc::new(transport.clone()), config());
        let leader = leader().await;

        dispatcher.dispatch(bundle(4), &[target.clone()], &leader).unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Acked { attempts: 3 });
        dispatcher.apply_report(&report);
        assert_eq!(dispatcher.status(&target).unwrap().acked_version, Some(4));
        assert_eq!(transport.versions_for(&target).await, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_after_threshold() {
        let transport = MemoryTransport::new();
        let node = Node::storage(0);
        let target = PushTarget::Node(node);
        transport.set_unreachable(target.clone(), true).await;
        let (mut dispatcher, mut reports) =
            BroadcastDispatcher::new(Arc::new(transport.clone()), config());
        let leader = leader().await;

        dispatcher.dispatch(bundle(1), &[target.clone()], &leader).unwrap();
        let first = reports.recv().await.unwrap();
        assert!(matches!(first.outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
        assert_eq!(dispatcher.apply_report(&first), None);
        let second = reports.recv().await.unwrap();
        assert_eq!(dispatcher.apply_report(&second), Some(node));
        assert_eq!(transport.attempts(&target).await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_report_is_discarded() {
        let transport = MemoryTransport::new();
        let target = PushTarget::Node(Node::storage(0));
        let (mut dispatcher, _reports) =
            BroadcastDispatcher::new(Arc::new(transport), config());
        let leader = leader().await;
        dispatcher.dispatch(bundle(2), &[target.clone()], &leader).unwrap();
        dispatcher.dispatch(bundle(3), &[target.clone()], &leader).unwrap();

        let late = DeliveryReport {
            target: target.clone(),
            version: 2,
            outcome: DeliveryOutcome::Acked { attempts: 1 },
        };
        assert_eq!(dispatcher.apply_report(&late), None);
        assert_eq!(dispatcher.status(&target).unwrap().acked_version, None);
        assert!(matches!(
            dispatcher.dispatch(bundle(1), &[target], &leader),
            Err(ControllerError::InvariantViolation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_stops_when_lease_expires() {
        let transport = MemoryTransport::new();
        let target = PushTarget::Node(Node::storage(0));
        transport.set_unreachable(target.clone(), true).await;
        let (mut dispatcher, _reports) =
            BroadcastDispatcher::new(Arc::new(transport.clone()), config());
        // Never renewed, so the lease runs out after one second
        let coordinator = LeaderCoordinator::new(
            "a",
            Arc::new(MemoryCoordinationStore::new()),
            CoordinationConfig {
                lease_ttl_ms: 1_000,
                ..Default::default()
            },
        );
        coordinator.try_acquire().await.unwrap();
        let leader = Arc::new(coordinator);

        dispatcher.dispatch(bundle(1), &[target.clone()], &leader).unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(leader.is_leader());
        assert!(!leader.can_publish(tokio::time::Instant::now()));
        let at_expiry = transport.attempts(&target).await;
        assert!(at_expiry > 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.attempts(&target).await, at_expiry);
    }

    #[tokio::test]
    async fn test_standby_cannot_dispatch() {
        let (mut dispatcher, _reports) =
            BroadcastDispatcher::new(Arc::new(MemoryTransport::new()), config());
        let standby = Arc::new(LeaderCoordinator::new(
            "b",
            Arc::new(MemoryCoordinationStore::new()),
            CoordinationConfig::default(),
        ));
        assert!(matches!(
            dispatcher.dispatch(bundle(1), &[], &standby),
            Err(ControllerError::NotLeader)
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = config();
        for retry in 0..10 {
            let delay = backoff_delay(&config, retry);
            assert!(delay <= Duration::from_millis(50));
        }
        assert!(backoff_delay(&config, 0) >= Duration::from_millis(10));
    }
}
