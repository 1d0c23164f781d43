//! The controller control loop.
//!
//! A [`Controller`] owns the registry, the statistics, the governor and the
//! dispatcher and is their only writer. It runs as one task that reacts to
//! commands from [`ControllerHandle`]s, delivery reports, leadership changes
//! and a periodic tick. The same steps are public so tests can drive the
//! controller deterministically without running the loop.

use crate::broadcast::{BroadcastDispatcher, DeliveryOutcome, DeliveryReport, PushTarget, StateTransport};
use crate::config::{ControllerConfig, FleetTopology};
use crate::coordination::{CoordinationStore, LeaderCoordinator, LeaderTerm, Leadership, Takeover};
use crate::error::{ControllerError, Result};
use crate::generator;
use crate::governor::{TransitionGovernor, Verdict};
use crate::observability::events::unix_millis;
use crate::observability::{ControllerEvent, ControllerMetrics, EventKind, EventLog};
use crate::registry::{wanted_from, HealthReport, NodeHealthRegistry, ReportOutcome};
use crate::state::{ClusterStateBundle, Node, State};
use crate::stats::{ContentClusterStats, FleetStats};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_LEN: usize = 1024;

/// What readers see of the controller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    /// Latest published version, `None` before the first publication
    pub version: Option<u64>,
    pub bundle: Option<Arc<ClusterStateBundle>>,
    /// Latest acknowledged version per push target
    pub acked_versions: BTreeMap<String, u64>,
    pub is_leader: bool,
    pub rejected_candidates: u64,
    pub pending_transitions: usize,
    /// How long each pending transition has been waiting, keyed by
    /// `scope/entry`
    pub pending_since: Vec<(String, Duration)>,
    pub deliveries_in_flight: usize,
    /// Statistics refresh cycles applied so far
    pub stats_cycle: u64,
}

enum Command {
    ReportHealth {
        report: HealthReport,
        reply: oneshot::Sender<Result<ReportOutcome>>,
    },
    SetWanted {
        node: Node,
        state: State,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RefreshStats(ContentClusterStats),
    UpdateTopology {
        fleet: FleetTopology,
        reply: oneshot::Sender<Result<()>>,
    },
    RegisterClient(String),
    Shutdown,
}

/// Cloneable handle for reporters, operators and readers
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusSnapshot>,
    events: Arc<EventLog>,
    metrics: Arc<ControllerMetrics>,
}

impl ControllerHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControllerError::Shutdown)
    }

    /// Deliver a health report. Replays of the same report are harmless.
    pub async fn report_health(&self, report: HealthReport) -> Result<ReportOutcome> {
        let (reply, response) = oneshot::channel();
        self.send(Command::ReportHealth { report, reply }).await?;
        response.await.map_err(|_| ControllerError::Shutdown)?
    }

    pub async fn set_wanted_state(&self, node: Node, state: State, reason: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::SetWanted {
            node,
            state,
            reason: reason.to_string(),
            reply,
        })
        .await?;
        response.await.map_err(|_| ControllerError::Shutdown)?
    }

    pub async fn refresh_stats(&self, stats: ContentClusterStats) -> Result<()> {
        self.send(Command::RefreshStats(stats)).await
    }

    pub async fn update_topology(&self, fleet: FleetTopology) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::UpdateTopology { fleet, reply }).await?;
        response.await.map_err(|_| ControllerError::Shutdown)?
    }

    /// Register a state consumer that receives every published version
    pub async fn register_client<S: Into<String>>(&self, id: S) -> Result<()> {
        self.send(Command::RegisterClient(id.into())).await
    }

    pub fn current_bundle(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait until a version at least `version` has been published
    pub async fn wait_for_version(&self, version: u64) -> Result<StatusSnapshot> {
        let mut status = self.status.clone();
        let snapshot = status
            .wait_for(|s| s.version.is_some_and(|v| v >= version))
            .await
            .map_err(|_| ControllerError::Shutdown)?;
        Ok(snapshot.clone())
    }

    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.recent(usize::MAX)
    }

    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

pub struct Controller {
    config: ControllerConfig,
    registry: NodeHealthRegistry,
    stats: FleetStats,
    governor: TransitionGovernor,
    dispatcher: BroadcastDispatcher,
    leader: Arc<LeaderCoordinator>,
    events: Arc<EventLog>,
    metrics: Arc<ControllerMetrics>,
    clients: BTreeSet<String>,
    started_at: Instant,
    published: Option<Arc<ClusterStateBundle>>,
    /// Leader term whose acquisition this controller has processed
    active_term: Option<u64>,
    /// Set on takeover; the next tick reconciles with the store
    resync: Option<Takeover>,
    rejected_candidates: u64,
    commands: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    delivery_rx: Option<mpsc::UnboundedReceiver<DeliveryReport>>,
    status: watch::Sender<StatusSnapshot>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn StateTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let leader = Arc::new(LeaderCoordinator::new(
            config.controller.id.clone(),
            store,
            config.coordination.clone(),
        ));
        let (dispatcher, delivery_rx) = BroadcastDispatcher::new(transport, config.broadcast.clone());
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let (status, _) = watch::channel(StatusSnapshot::default());

        Ok(Self {
            registry: NodeHealthRegistry::new(&config.fleet),
            stats: FleetStats::new(),
            governor: TransitionGovernor::new(config.transition.clone()),
            dispatcher,
            leader,
            events: Arc::new(EventLog::default()),
            metrics: Arc::new(ControllerMetrics::new()),
            clients: BTreeSet::new(),
            started_at: Instant::now(),
            published: None,
            active_term: None,
            resync: None,
            rejected_candidates: 0,
            commands,
            command_rx: Some(command_rx),
            delivery_rx: Some(delivery_rx),
            status,
            config,
        })
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.commands.clone(),
            status: self.status.subscribe(),
            events: Arc::clone(&self.events),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.controller.id
    }

    pub fn leader(&self) -> &Arc<LeaderCoordinator> {
        &self.leader
    }

    pub fn registry(&self) -> &NodeHealthRegistry {
        &self.registry
    }

    pub fn published(&self) -> Option<&Arc<ClusterStateBundle>> {
        self.published.as_ref()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            version: self.published.as_ref().map(|b| b.version),
            bundle: self.published.clone(),
            acked_versions: self.dispatcher.acked_versions(),
            is_leader: self.leader.is_leader(),
            rejected_candidates: self.rejected_candidates,
            pending_transitions: self.governor.pending_count(),
            pending_since: self.governor.pending_since(Instant::now()),
            deliveries_in_flight: self.dispatcher.in_flight(),
            stats_cycle: self.stats.cycle(),
        }
    }

    fn update_status(&self) {
        self.status.send_replace(self.status());
    }

    pub fn report_health(&mut self, report: HealthReport) -> Result<ReportOutcome> {
        self.metrics.reports_received.inc();
        let outcome = self.registry.report(&report)?;
        if outcome == ReportOutcome::Stale {
            self.metrics.reports_stale.inc();
            debug!(node = %report.node, timestamp_ms = report.timestamp_ms, "stale health report ignored");
        }
        Ok(outcome)
    }

    /// Apply an operator override. Rejected when it alone would take the
    /// cluster from up to down.
    pub fn set_wanted_state(&mut self, node: Node, state: State, reason: &str) -> Result<()> {
        self.registry.validate_wanted(node, state)?;
        let snapshot = self.registry.snapshot();
        let stats = self.stats.snapshot();
        let fleet = &self.config.fleet;
        let policy = &self.config.policy;

        let current = generator::generate(&snapshot, fleet, policy, &stats)?;
        let prospective_registry = snapshot.with_wanted(node, wanted_from(state, reason));
        let prospective = generator::generate(&prospective_registry, fleet, policy, &stats)?;
        if current.baseline.state.is_cluster_up() && !prospective.baseline.state.is_cluster_up() {
            self.metrics.policy_violations.inc();
            let cause = prospective.baseline.cluster_reason.unwrap_or_default();
            warn!(node = %node, wanted = %state, %cause, "wanted state rejected");
            return Err(ControllerError::PolicyViolation(format!(
                "setting {} to {} would take the cluster down: {}",
                node, state, cause
            )));
        }

        self.registry.set_wanted(node, state, reason)?;
        self.events.record(
            EventKind::WantedState,
            format!("{} wanted {}: {}", node, state, reason),
        );
        Ok(())
    }

    pub fn refresh_stats(&mut self, update: ContentClusterStats) {
        self.stats.refresh(update);
    }

    pub fn update_topology(&mut self, fleet: FleetTopology) -> Result<()> {
        fleet.validate()?;
        let change = self.registry.apply_topology(&fleet);
        for node in &change.removed {
            if !node.kind.is_bucket_space_independent() {
                self.stats.remove(node.index);
            }
        }
        self.config.fleet = fleet;
        Ok(())
    }

    pub fn register_client<S: Into<String>>(&mut self, id: S) {
        let id = id.into();
        if !self.clients.insert(id.clone()) {
            return;
        }
        info!(client = %id, "state client registered");
        if let Some(bundle) = self.published.clone() {
            if self.leader.is_leader() && self.dispatcher.latest_version() == bundle.version {
                if let Err(e) = self
                    .dispatcher
                    .dispatch_one(bundle, PushTarget::Client(id), &self.leader)
                {
                    warn!(error = %e, "could not push current state to new client");
                }
            }
        }
    }

    /// Try to take the lease now; true when this instance became leader
    pub async fn acquire_leadership(&mut self) -> Result<bool> {
        if self.leader.try_acquire().await?.is_none() {
            return Ok(false);
        }
        match self.leader.leadership() {
            Leadership::Leader(term) => {
                self.on_leadership_acquired(term);
                Ok(true)
            }
            Leadership::Standby => Ok(false),
        }
    }

    pub fn on_leadership_acquired(&mut self, term: LeaderTerm) {
        let takeover = term.takeover;
        self.dispatcher.cancel_all();
        self.active_term = Some(term.term);
        self.metrics.lease_acquisitions.inc();
        self.metrics.is_leader.set(1);
        self.events.record(
            EventKind::Leadership,
            format!(
                "{} acquired leadership, last published version {}",
                self.config.controller.id, takeover.last_version
            ),
        );
        self.resync = Some(takeover);
        self.update_status();
    }

    pub fn on_leadership_lost(&mut self) {
        self.dispatcher.cancel_all();
        self.active_term = None;
        self.resync = None;
        self.metrics.lease_losses.inc();
        self.metrics.is_leader.set(0);
        self.events.record(
            EventKind::Leadership,
            format!("{} lost leadership", self.config.controller.id),
        );
        self.update_status();
    }

    /// One generation and publication cycle. Returns the version published
    /// in this cycle, if any. On error the last published bundle stays.
    pub async fn tick(&mut self, now: Instant) -> Result<Option<u64>> {
        if !self.holds_processed_term() {
            return Ok(None);
        }
        let snapshot = self.registry.snapshot();
        if !snapshot.all_reported() && now < self.started_at + self.config.timing.startup_grace() {
            return Ok(None);
        }

        let candidate = match generator::generate(
            &snapshot,
            &self.config.fleet,
            &self.config.policy,
            &self.stats.snapshot(),
        ) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.reject_candidate(&e);
                return Err(e);
            }
        };

        if let Some(takeover) = self.resync.take() {
            return self.resync_after_takeover(takeover, candidate, now).await;
        }

        let verdict = self.governor.evaluate(&candidate, &snapshot, now);
        self.metrics
            .pending_transitions
            .set(self.governor.pending_count() as u64);
        match verdict {
            Verdict::Publish(bundle) => self.publish(bundle, now).await.map(Some),
            Verdict::Throttled => {
                self.metrics.throttled.inc();
                Ok(None)
            }
            Verdict::Pending | Verdict::Unchanged => Ok(None),
        }
    }

    /// Leader, and the acquisition of the current term has been handled
    fn holds_processed_term(&self) -> bool {
        match self.leader.leadership() {
            Leadership::Leader(term) => self.active_term == Some(term.term),
            Leadership::Standby => false,
        }
    }

    async fn resync_after_takeover(
        &mut self,
        takeover: Takeover,
        candidate: ClusterStateBundle,
        now: Instant,
    ) -> Result<Option<u64>> {
        match takeover.last_bundle {
            Some(last) if last.similar_to(&candidate) => {
                // Keep the committed states so hysteresis carries over, but
                // number the re-push after the stored version
                info!(version = last.version, "adopting last published cluster state");
                self.governor.reset(Some(last.clone()));
                self.publish(last, now).await.map(Some)
            }
            last => {
                // The fleet changed since the last publication: publish the
                // fresh candidate without waiting for hysteresis
                self.governor.reset(last);
                self.publish(candidate, now).await.map(Some)
            }
        }
    }

    async fn publish(&mut self, bundle: ClusterStateBundle, now: Instant) -> Result<u64> {
        let version = self.leader.next_version();
        let bundle = bundle.with_version(version, unix_millis());
        if let Err(e) = bundle.validate() {
            self.reject_candidate(&e);
            return Err(e);
        }
        self.leader.record_publication(&bundle).await?;
        self.governor.accept(&bundle, now);

        let bundle = Arc::new(bundle);
        let previous = self.published.replace(Arc::clone(&bundle));
        self.record_transitions(previous.as_deref(), &bundle);
        self.metrics.publications.inc();
        self.metrics.current_version.set(version);
        self.events.record(EventKind::Publication, bundle.to_string());
        info!(version, state = %bundle.baseline.state, "published cluster state");

        self.dispatch(bundle);
        self.update_status();
        Ok(version)
    }

    fn dispatch(&mut self, bundle: Arc<ClusterStateBundle>) {
        let targets: Vec<PushTarget> = bundle
            .baseline
            .state
            .nodes()
            .map(|(node, _)| PushTarget::Node(node))
            .chain(self.clients.iter().cloned().map(PushTarget::Client))
            .collect();
        if let Err(e) = self.dispatcher.dispatch(bundle, &targets, &self.leader) {
            warn!(error = %e, "cluster state not dispatched");
        }
    }

    fn record_transitions(&self, previous: Option<&ClusterStateBundle>, next: &ClusterStateBundle) {
        let baseline = &next.baseline;
        for (node, state) in baseline.state.nodes() {
            let before = previous.and_then(|p| p.baseline.state.get(node));
            if before == Some(state) {
                continue;
            }
            let from = before.map_or("absent", State::as_str);
            let description = match baseline.reason(node) {
                Some(reason) => format!("{}: {} -> {} ({})", node, from, state, reason),
                None => format!("{}: {} -> {}", node, from, state),
            };
            debug!(version = next.version, "{}", description);
            self.events.record(EventKind::NodeTransition, description);
        }
        let cluster_before = previous.map(|p| p.baseline.state.cluster);
        if cluster_before != Some(baseline.state.cluster) {
            let cause = baseline.cluster_reason.as_deref().unwrap_or("quorum restored");
            info!(version = next.version, cluster = %baseline.state.cluster, cause, "cluster state changed");
        }
    }

    fn reject_candidate(&mut self, e: &ControllerError) {
        self.rejected_candidates += 1;
        self.metrics.rejected_candidates.inc();
        error!(error = %e, "candidate cluster state rejected");
        self.events
            .record(EventKind::RejectedCandidate, e.to_string());
        self.update_status();
    }

    /// Fold a delivery report in; repeated failures mark the node down
    pub fn apply_delivery(&mut self, report: DeliveryReport) -> Result<()> {
        if report.version >= self.dispatcher.latest_version() {
            match report.outcome {
                DeliveryOutcome::Acked { .. } => self.metrics.deliveries_acked.inc(),
                DeliveryOutcome::Failed { .. } => self.metrics.deliveries_failed.inc(),
            }
        }
        if let Some(node) = self.dispatcher.apply_report(&report) {
            if self.registry.mark_unreachable(node)? {
                self.metrics.synthetic_down_reports.inc();
                self.events.record(
                    EventKind::NodeTransition,
                    format!("{} reported down after repeated delivery failures", node),
                );
            }
        }
        self.update_status();
        Ok(())
    }

    /// Apply delivery reports already received, waiting up to `wait` for
    /// each of at most `count`. Returns how many were applied.
    pub async fn process_deliveries(&mut self, count: usize, wait: Duration) -> Result<usize> {
        let mut applied = 0;
        while applied < count {
            let Some(receiver) = self.delivery_rx.as_mut() else {
                break;
            };
            match tokio::time::timeout(wait, receiver.recv()).await {
                Ok(Some(report)) => {
                    self.apply_delivery(report)?;
                    applied += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(applied)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ReportHealth { report, reply } => {
                let _ = reply.send(self.report_health(report));
            }
            Command::SetWanted {
                node,
                state,
                reason,
                reply,
            } => {
                let _ = reply.send(self.set_wanted_state(node, state, &reason));
            }
            Command::RefreshStats(stats) => self.refresh_stats(stats),
            Command::UpdateTopology { fleet, reply } => {
                let _ = reply.send(self.update_topology(fleet));
            }
            Command::RegisterClient(id) => self.register_client(id),
            Command::Shutdown => {}
        }
    }

    /// Run until shut down through a handle
    pub async fn run(mut self) -> Result<()> {
        let mut commands = self.command_rx.take().ok_or(ControllerError::Shutdown)?;
        let mut deliveries = self.delivery_rx.take().ok_or(ControllerError::Shutdown)?;
        let mut leadership = self.leader.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lease_loop = tokio::spawn(Arc::clone(&self.leader).run_lease_loop(shutdown_rx));

        let mut ticker = tokio::time::interval(self.config.timing.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(id = %self.config.controller.id, nodes = self.registry.len(), "controller started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(report) = deliveries.recv() => {
                    if let Err(e) = self.apply_delivery(report) {
                        warn!(error = %e, "delivery report not applied");
                    }
                }
                changed = leadership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = leadership.borrow_and_update().clone();
                    match current {
                        Leadership::Leader(term) => self.on_leadership_acquired(term),
                        Leadership::Standby => self.on_leadership_lost(),
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Instant::now()).await {
                        warn!(error = %e, "control cycle failed");
                    }
                }
            }
        }

        info!(id = %self.config.controller.id, "controller shutting down");
        self.dispatcher.cancel_all();
        shutdown_tx.send_replace(true);
        if let Err(e) = lease_loop.await {
            warn!(error = %e, "lease task ended abnormally");
        }
        self.update_status();
        Ok(())
    }
}
