//! Node health registry.
//!
//! Holds the latest reported and wanted state of every configured node.
//! Reports are ordered by their own timestamp, not by arrival: a late or
//! duplicated report never regresses what is stored. The registry is owned
//! by the control loop; everyone else works on an immutable
//! [`RegistrySnapshot`].

use crate::config::FleetTopology;
use crate::error::{ControllerError, Result};
use crate::state::{Node, NodeKind, State};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A health observation delivered by the heartbeat collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub node: Node,
    /// Restricts the report to one bucket space (storage nodes only)
    pub bucket_space: Option<String>,
    pub state: State,
    /// Reporter's timestamp in milliseconds; orders reports per node
    pub timestamp_ms: u64,
    /// Process start time; a change means the node restarted
    pub start_timestamp: Option<u64>,
}

impl HealthReport {
    pub fn new(node: Node, state: State, timestamp_ms: u64) -> Self {
        Self {
            node,
            bucket_space: None,
            state,
            timestamp_ms,
            start_timestamp: None,
        }
    }

    pub fn in_bucket_space<S: Into<String>>(mut self, space: S) -> Self {
        self.bucket_space = Some(space.into());
        self
    }

    pub fn with_start_timestamp(mut self, start: u64) -> Self {
        self.start_timestamp = Some(start);
        self
    }
}

/// What a report did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Stored; a generation pass is needed
    Applied,
    /// Exact replay of the stored report
    Unchanged,
    /// Older than the stored report, ignored
    Stale,
}

impl ReportOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedState {
    pub state: State,
    pub timestamp_ms: u64,
    /// Down fed by the broadcast dispatcher rather than by the node
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedState {
    pub state: State,
    pub reason: String,
}

/// Everything known about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node: Node,
    pub group: String,
    pub retired: bool,
    pub reported: Option<ReportedState>,
    pub space_reported: BTreeMap<String, ReportedState>,
    pub wanted: Option<WantedState>,
    pub start_timestamp: Option<u64>,
    pub restarts: u32,
    /// Consecutive reports in an available state, reset by anything else
    pub consecutive_available_reports: u32,
}

impl NodeRecord {
    fn new(node: Node, group: String, retired: bool) -> Self {
        Self {
            node,
            group,
            retired,
            reported: None,
            space_reported: BTreeMap::new(),
            wanted: None,
            start_timestamp: None,
            restarts: 0,
            consecutive_available_reports: 0,
        }
    }

    pub fn has_reported(&self) -> bool {
        self.reported.is_some()
    }
}

/// Immutable copy of the registry handed to the generator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    nodes: BTreeMap<Node, NodeRecord>,
}

impl RegistrySnapshot {
    pub fn get(&self, node: Node) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether every node has delivered at least one report
    pub fn all_reported(&self) -> bool {
        self.nodes.values().all(NodeRecord::has_reported)
    }

    /// A copy with one node's wanted state replaced, for evaluating an
    /// operator request before applying it
    pub fn with_wanted(&self, node: Node, wanted: Option<WantedState>) -> Self {
        let mut copy = self.clone();
        if let Some(record) = copy.nodes.get_mut(&node) {
            record.wanted = wanted;
        }
        copy
    }
}

/// Result of applying a new fleet topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChange {
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
}

#[derive(Debug, Default)]
pub struct NodeHealthRegistry {
    nodes: BTreeMap<Node, NodeRecord>,
    /// Bucket spaces a report may be restricted to
    bucket_spaces: BTreeSet<String>,
    cached: Option<Arc<RegistrySnapshot>>,
}

impl NodeHealthRegistry {
    pub fn new(topology: &FleetTopology) -> Self {
        let mut registry = Self::default();
        registry.apply_topology(topology);
        registry
    }

    pub fn get(&self, node: Node) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes.keys().copied()
    }

    fn record_mut(&mut self, node: Node) -> Result<&mut NodeRecord> {
        self.cached = None;
        self.nodes
            .get_mut(&node)
            .ok_or(ControllerError::UnknownNode(node))
    }

    /// Store a health report if it is not older than what is stored
    pub fn report(&mut self, report: &HealthReport) -> Result<ReportOutcome> {
        let invalid = |reason: &str| ControllerError::InvalidReport {
            node: report.node,
            reason: reason.to_string(),
        };
        if report.state == State::Retired {
            return Err(invalid("retired is not a reportable state"));
        }
        if !self.nodes.contains_key(&report.node) {
            return Err(ControllerError::UnknownNode(report.node));
        }

        match &report.bucket_space {
            None => self.report_global(report),
            Some(space) => {
                if report.node.kind.is_bucket_space_independent() {
                    return Err(invalid("distributors have no bucket space specific state"));
                }
                if report.state == State::Initializing {
                    return Err(invalid("initializing cannot be reported per bucket space"));
                }
                if !self.bucket_spaces.contains(space) {
                    return Err(invalid(&format!("unknown bucket space '{}'", space)));
                }
                self.report_space(report, space)
            }
        }
    }

    fn report_global(&mut self, report: &HealthReport) -> Result<ReportOutcome> {
        let outcome = ordering_outcome(self.get(report.node).and_then(|r| r.reported.as_ref()), report);
        if outcome != ReportOutcome::Applied {
            return Ok(outcome);
        }

        let record = self.record_mut(report.node)?;
        if let Some(start) = report.start_timestamp {
            if record.start_timestamp.is_some_and(|previous| previous != start) {
                record.restarts = record.restarts.saturating_add(1);
                record.consecutive_available_reports = 0;
                info!(node = %report.node, restarts = record.restarts, "node restarted");
            }
            record.start_timestamp = Some(start);
        }

        if matches!(report.state, State::Up | State::Initializing) {
            record.consecutive_available_reports =
                record.consecutive_available_reports.saturating_add(1);
        } else {
            record.consecutive_available_reports = 0;
        }

        let previous = record.reported.as_ref().map(|r| r.state);
        record.reported = Some(ReportedState {
            state: report.state,
            timestamp_ms: report.timestamp_ms,
            synthetic: false,
        });
        if previous != Some(report.state) {
            debug!(node = %report.node, state = %report.state, ?previous, "reported state changed");
        }
        Ok(ReportOutcome::Applied)
    }

    fn report_space(&mut self, report: &HealthReport, space: &str) -> Result<ReportOutcome> {
        let stored = self
            .get(report.node)
            .and_then(|r| r.space_reported.get(space));
        let outcome = ordering_outcome(stored, report);
        if outcome != ReportOutcome::Applied {
            return Ok(outcome);
        }
        let record = self.record_mut(report.node)?;
        record.space_reported.insert(
            space.to_string(),
            ReportedState {
                state: report.state,
                timestamp_ms: report.timestamp_ms,
                synthetic: false,
            },
        );
        Ok(ReportOutcome::Applied)
    }

    /// Check that `state` is acceptable as a wanted state for `node`
    pub fn validate_wanted(&self, node: Node, state: State) -> Result<()> {
        if !self.nodes.contains_key(&node) {
            return Err(ControllerError::UnknownNode(node));
        }
        let allowed = match (node.kind, state) {
            (_, State::Initializing) => false,
            (NodeKind::Distributor, State::Maintenance | State::Retired) => false,
            _ => true,
        };
        if !allowed {
            return Err(ControllerError::InvalidTransition { node, state });
        }
        Ok(())
    }

    /// Store an operator override; `Up` clears it
    pub fn set_wanted(&mut self, node: Node, state: State, reason: &str) -> Result<()> {
        self.validate_wanted(node, state)?;
        let record = self.record_mut(node)?;
        record.wanted = wanted_from(state, reason);
        info!(node = %node, wanted = %state, reason, "wanted state set");
        Ok(())
    }

    /// Record that control traffic to the node keeps failing. Returns true
    /// when this changed the node's reported state.
    pub fn mark_unreachable(&mut self, node: Node) -> Result<bool> {
        let current = self
            .get(node)
            .ok_or(ControllerError::UnknownNode(node))?
            .reported
            .clone();
        // Never-reported nodes are already treated as down
        let Some(current) = current else {
            return Ok(false);
        };
        if current.state == State::Down {
            return Ok(false);
        }
        let record = self.record_mut(node)?;
        record.consecutive_available_reports = 0;
        record.reported = Some(ReportedState {
            state: State::Down,
            timestamp_ms: current.timestamp_ms,
            synthetic: true,
        });
        info!(node = %node, "node marked down after repeated delivery failures");
        Ok(true)
    }

    /// Add records for new indices, refresh group and retired flags, and
    /// remove nodes whose index is no longer configured
    pub fn apply_topology(&mut self, topology: &FleetTopology) -> TopologyChange {
        self.cached = None;
        let mut change = TopologyChange::default();

        for group in &topology.groups {
            for config in &group.nodes {
                for kind in NodeKind::ALL {
                    let node = Node::new(kind, config.index);
                    match self.nodes.get_mut(&node) {
                        Some(record) => {
                            record.group = group.name.clone();
                            record.retired = config.retired;
                        }
                        None => {
                            self.nodes.insert(
                                node,
                                NodeRecord::new(node, group.name.clone(), config.retired),
                            );
                            change.added.push(node);
                        }
                    }
                }
            }
        }

        self.bucket_spaces = topology.bucket_spaces.iter().cloned().collect();
        for record in self.nodes.values_mut() {
            let spaces = &self.bucket_spaces;
            record.space_reported.retain(|space, _| spaces.contains(space));
        }

        let configured: BTreeSet<u16> = topology.indices().collect();
        self.nodes.retain(|node, _| {
            let keep = configured.contains(&node.index);
            if !keep {
                change.removed.push(*node);
            }
            keep
        });

        if !change.added.is_empty() || !change.removed.is_empty() {
            info!(
                added = change.added.len(),
                removed = change.removed.len(),
                "fleet topology applied"
            );
        }
        change
    }

    pub fn snapshot(&mut self) -> Arc<RegistrySnapshot> {
        if let Some(snapshot) = &self.cached {
            return Arc::clone(snapshot);
        }
        let snapshot = Arc::new(RegistrySnapshot {
            nodes: self.nodes.clone(),
        });
        self.cached = Some(Arc::clone(&snapshot));
        snapshot
    }
}

pub(crate) fn wanted_from(state: State, reason: &str) -> Option<WantedState> {
    match state {
        State::Up => None,
        state => Some(WantedState {
            state,
            reason: reason.to_string(),
        }),
    }
}

/// Last-writer-wins by report timestamp. A synthetic down is only replaced
/// by a strictly newer report.
fn ordering_outcome(stored: Option<&ReportedState>, report: &HealthReport) -> ReportOutcome {
    let Some(stored) = stored else {
        return ReportOutcome::Applied;
    };
    if report.timestamp_ms < stored.timestamp_ms {
        return ReportOutcome::Stale;
    }
    if report.timestamp_ms == stored.timestamp_ms {
        if stored.synthetic {
            return ReportOutcome::Stale;
        }
        if stored.state == report.state {
            return ReportOutcome::Unchanged;
        }
    }
    ReportOutcome::Applied
}
