//! State generator.
//!
//! Computes a candidate bundle from the registry, the topology, the policy
//! and the latest statistics. Generation is a pure function of its inputs;
//! the returned bundle has version 0 and is versioned only when published.

use crate::config::{FleetTopology, GenerationPolicy};
use crate::error::Result;
use crate::registry::{NodeRecord, RegistrySnapshot};
use crate::stats::ContentClusterStats;
use crate::state::{
    AnnotatedClusterState, ClusterState, ClusterStateBundle, Node, NodeKind, State, StateReason,
};
use std::collections::{BTreeMap, BTreeSet};

/// Generate the candidate bundle for the current inputs
pub fn generate(
    registry: &RegistrySnapshot,
    topology: &FleetTopology,
    policy: &GenerationPolicy,
    stats: &ContentClusterStats,
) -> Result<ClusterStateBundle> {
    let mut state = ClusterState::new();
    let mut reasons = BTreeMap::new();
    let mut drained = BTreeSet::new();

    for record in registry.iter() {
        let (node_state, reason) = effective_state(record);
        if let Some(reason) = reason {
            reasons.insert(record.node, reason);
        }
        state.set_node_state(record.node, node_state);

        if is_drained(record, stats) {
            drained.insert(record.node.index);
            if node_state.is_available() {
                state.set_node_state(record.node, State::Down);
                reasons.insert(record.node, StateReason::RetiredDrained);
            }
        }
    }

    let healthy_groups = apply_group_availability(&mut state, &mut reasons, topology, policy, &drained);
    let cluster_reason = cluster_down_reason(&state, topology, policy, &drained, healthy_groups);
    if cluster_reason.is_some() {
        state.cluster = State::Down;
    }

    let baseline = AnnotatedClusterState::new(state, reasons, cluster_reason);
    let derived = topology
        .bucket_spaces
        .iter()
        .map(|space| (space.clone(), derive_space(&baseline, registry, space)))
        .collect();

    let bundle = ClusterStateBundle::new(baseline, derived);
    if let Err(err) = bundle.validate() {
        tracing::error!(error = %err, bundle = %bundle, "generated an invalid candidate");
        return Err(err);
    }
    Ok(bundle)
}

/// Reported state combined with wanted state and the retired flag
fn effective_state(record: &NodeRecord) -> (State, Option<StateReason>) {
    let Some(reported) = &record.reported else {
        return (State::Down, Some(StateReason::NeverReported));
    };
    let mut state = reported.state;
    let mut reason = reported.synthetic.then_some(StateReason::Unreachable);

    let is_storage = record.node.kind == NodeKind::Storage;
    if let Some(wanted) = &record.wanted {
        let applies = is_storage || wanted.state != State::Retired;
        if applies && wanted.state.is_more_restrictive_than(state) {
            state = wanted.state;
            reason = Some(StateReason::WantedState(wanted.reason.clone()));
        }
    }
    if is_storage && record.retired && state == State::Up {
        state = State::Retired;
    }
    (state, reason)
}

/// Retired storage node whose statistics show no buckets at all
fn is_drained(record: &NodeRecord, stats: &ContentClusterStats) -> bool {
    if record.node.kind != NodeKind::Storage {
        return false;
    }
    let retired = record.retired
        || record
            .wanted
            .as_ref()
            .is_some_and(|w| w.state == State::Retired);
    retired
        && stats
            .node(record.node.index)
            .is_some_and(|node_stats| node_stats.is_empty())
}

/// Take down every group whose available storage ratio is below its
/// minimum. Returns the number of healthy groups.
fn apply_group_availability(
    state: &mut ClusterState,
    reasons: &mut BTreeMap<Node, StateReason>,
    topology: &FleetTopology,
    policy: &GenerationPolicy,
    drained: &BTreeSet<u16>,
) -> usize {
    let mut healthy = 0;
    for group in &topology.groups {
        let counted: Vec<u16> = group
            .nodes
            .iter()
            .map(|n| n.index)
            .filter(|i| !drained.contains(i) && state.get(Node::storage(*i)).is_some())
            .collect();
        if counted.is_empty() {
            continue;
        }
        let available = counted
            .iter()
            .filter(|i| state.node_state(Node::storage(**i)).is_available())
            .count();
        let ratio = available as f64 / counted.len() as f64;
        let min_ratio = group.min_node_ratio.unwrap_or(policy.min_node_ratio_per_group);

        if ratio < min_ratio {
            tracing::debug!(
                group = %group.name,
                available,
                total = counted.len(),
                min_ratio,
                "group availability below minimum"
            );
            let reason = StateReason::GroupAvailabilityBelowMinimum {
                group: group.name.clone(),
                available,
                total: counted.len(),
            };
            for config in &group.nodes {
                for kind in NodeKind::ALL {
                    let node = Node::new(kind, config.index);
                    match state.get(node) {
                        Some(State::Down) | None => {}
                        Some(_) => {
                            state.set_node_state(node, State::Down);
                            reasons.insert(node, reason.clone());
                        }
                    }
                }
            }
        } else if available > 0 {
            healthy += 1;
        }
    }
    healthy
}

fn cluster_down_reason(
    state: &ClusterState,
    topology: &FleetTopology,
    policy: &GenerationPolicy,
    drained: &BTreeSet<u16>,
    healthy_groups: usize,
) -> Option<String> {
    let distributors_total = state.node_count(NodeKind::Distributor);
    let distributors_up = state.available_count(NodeKind::Distributor);
    let storage_total = state
        .storage
        .keys()
        .filter(|i| !drained.contains(i))
        .count();
    let storage_up = state.available_count(NodeKind::Storage);

    if distributors_up < policy.min_distributors_up {
        return Some(format!(
            "{} of required {} distributors available",
            distributors_up, policy.min_distributors_up
        ));
    }
    if storage_up < policy.min_storage_up {
        return Some(format!(
            "{} of required {} storage nodes available",
            storage_up, policy.min_storage_up
        ));
    }
    if below_ratio(distributors_up, distributors_total, policy.min_distributor_up_ratio) {
        return Some(format!(
            "distributor availability {}/{} below ratio {}",
            distributors_up, distributors_total, policy.min_distributor_up_ratio
        ));
    }
    if below_ratio(storage_up, storage_total, policy.min_storage_up_ratio) {
        return Some(format!(
            "storage availability {}/{} below ratio {}",
            storage_up, storage_total, policy.min_storage_up_ratio
        ));
    }

    let groups = topology
        .groups
        .iter()
        .filter(|g| g.nodes.iter().any(|n| !drained.contains(&n.index)))
        .count();
    let required = required_count(policy.min_groups_up_ratio, groups);
    if healthy_groups < required {
        return Some(format!(
            "{} of required {} groups available",
            healthy_groups, required
        ));
    }
    None
}

/// `ceil(ratio * total)`, tolerating the rounding error of the product so
/// that an exact boundary such as 0.28 of 25 is not rounded up to 8
pub fn required_count(ratio: f64, total: usize) -> usize {
    let required = (ratio * total as f64 - 1e-9).ceil();
    if required <= 0.0 {
        0
    } else {
        required as usize
    }
}

fn below_ratio(available: usize, total: usize, min_ratio: f64) -> bool {
    if total == 0 {
        return min_ratio > 0.0;
    }
    (available as f64 / total as f64) < min_ratio
}

/// Apply bucket space specific storage reports on top of the baseline.
/// Only restrictions are applied, so the result never expands the baseline.
fn derive_space(
    baseline: &AnnotatedClusterState,
    registry: &RegistrySnapshot,
    space: &str,
) -> AnnotatedClusterState {
    let mut derived = baseline.clone();
    for record in registry.iter() {
        if record.node.kind.is_bucket_space_independent() {
            continue;
        }
        let Some(reported) = record.space_reported.get(space) else {
            continue;
        };
        let base = baseline.state.node_state(record.node);
        if reported.state.is_more_restrictive_than(base) {
            derived.state.set_node_state(record.node, reported.state);
            derived.reasons.insert(
                record.node,
                StateReason::BucketSpaceOverride(space.to_string()),
            );
        }
    }
    derived
}
