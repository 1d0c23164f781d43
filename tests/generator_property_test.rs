//! Property-based tests for state generation
//!
//! Random fleets and health reports must always produce a bundle that
//! respects the availability policy.

use clusterctl::config::{FleetTopology, GenerationPolicy};
use clusterctl::generator::generate;
use clusterctl::registry::{HealthReport, NodeHealthRegistry};
use clusterctl::state::NodeKind;
use clusterctl::stats::ContentClusterStats;
use clusterctl::{Node, State};
use proptest::prelude::*;

/// States a node can report about itself
fn reported_state() -> impl Strategy<Value = State> {
    prop_oneof![
        4 => Just(State::Up),
        2 => Just(State::Down),
        1 => Just(State::Initializing),
        1 => Just(State::Stopping),
        1 => Just(State::Maintenance),
    ]
}

/// Group layout plus one reported state per distributor and storage node
fn fleet() -> impl Strategy<Value = (usize, usize, Vec<State>, Vec<State>)> {
    (1usize..=3, 1usize..=6).prop_flat_map(|(groups, per_group)| {
        let nodes = groups * per_group;
        (
            Just(groups),
            Just(per_group),
            prop::collection::vec(reported_state(), nodes),
            prop::collection::vec(reported_state(), nodes),
        )
    })
}

/// Arbitrary ratios mixed with exact fractions that sit on a boundary
fn ratio() -> impl Strategy<Value = f64> {
    prop_oneof![
        0.0f64..=1.0,
        (1u32..=40, 1u32..=40).prop_map(|(a, b)| a.min(b) as f64 / b.max(a) as f64),
    ]
}

/// Groups with at least one available storage node
fn healthy_groups(topology: &FleetTopology, storage: &[State]) -> usize {
    topology
        .groups
        .iter()
        .filter(|g| g.nodes.iter().any(|n| storage[n.index as usize].is_available()))
        .count()
}

/// `healthy >= ceil(ratio * groups)`, checked as a fraction of groups
fn meets_group_quorum(healthy: usize, groups: usize, ratio: f64) -> bool {
    healthy as f64 / groups as f64 >= ratio
}

fn registry_for(topology: &FleetTopology, distributors: &[State], storage: &[State]) -> NodeHealthRegistry {
    let mut registry = NodeHealthRegistry::new(topology);
    for (index, state) in distributors.iter().enumerate() {
        registry
            .report(&HealthReport::new(Node::distributor(index as u16), *state, 1))
            .unwrap();
    }
    for (index, state) in storage.iter().enumerate() {
        registry
            .report(&HealthReport::new(Node::storage(index as u16), *state, 1))
            .unwrap();
    }
    registry
}

proptest! {
    /// A group below its minimum ratio is entirely down, a group at or
    /// above it keeps its reported states
    #[test]
    fn group_ratio_is_enforced(
        (groups, per_group, distributors, storage) in fleet(),
        ratio in 0.0f64..=1.0,
    ) {
        let topology = FleetTopology::uniform(groups, per_group);
        let policy = GenerationPolicy { min_node_ratio_per_group: ratio, ..Default::default() };
        let mut registry = registry_for(&topology, &distributors, &storage);
        let bundle = generate(&registry.snapshot(), &topology, &policy, &ContentClusterStats::new()).unwrap();
        let baseline = &bundle.baseline.state;

        for group in &topology.groups {
            let indices: Vec<u16> = group.nodes.iter().map(|n| n.index).collect();
            let available = indices
                .iter()
                .filter(|i| storage[**i as usize].is_available())
                .count();
            let below = (available as f64 / indices.len() as f64) < ratio;
            for index in &indices {
                for node in [Node::distributor(*index), Node::storage(*index)] {
                    let reported = match node.kind {
                        NodeKind::Distributor => distributors[*index as usize],
                        NodeKind::Storage => storage[*index as usize],
                    };
                    let expected = if below { State::Down } else { reported };
                    prop_assert_eq!(baseline.node_state(node), expected, "{} in {}", node, group.name);
                }
            }
        }
    }

    /// The cluster is up exactly when the configured minimums are met
    #[test]
    fn cluster_up_implies_quorum(
        (groups, per_group, distributors, storage) in fleet(),
        min_storage_up in 0usize..=6,
        min_storage_up_ratio in 0.0f64..=1.0,
        min_groups_up_ratio in ratio(),
    ) {
        let topology = FleetTopology::uniform(groups, per_group);
        let policy = GenerationPolicy {
            min_storage_up,
            min_storage_up_ratio,
            min_groups_up_ratio,
            ..Default::default()
        };
        let mut registry = registry_for(&topology, &distributors, &storage);
        let bundle = generate(&registry.snapshot(), &topology, &policy, &ContentClusterStats::new()).unwrap();
        let baseline = &bundle.baseline.state;

        let storage_up = storage.iter().filter(|s| s.is_available()).count();
        let distributors_up = distributors.iter().filter(|s| s.is_available()).count();
        let healthy = healthy_groups(&topology, &storage);
        let quorum = meets_group_quorum(healthy, groups, min_groups_up_ratio);
        let expected_up = distributors_up >= policy.min_distributors_up
            && storage_up >= min_storage_up
            && storage_up as f64 / storage.len() as f64 >= min_storage_up_ratio
            && quorum;

        prop_assert_eq!(
            baseline.is_cluster_up(),
            expected_up,
            "{} of {} groups healthy at ratio {}",
            healthy,
            groups,
            min_groups_up_ratio
        );
        if baseline.is_cluster_up() {
            prop_assert!(quorum);
            prop_assert!(bundle.baseline.cluster_reason.is_none());
        } else {
            prop_assert!(bundle.baseline.cluster_reason.is_some());
        }
    }

    /// Many small groups put the quorum boundary under pressure
    #[test]
    fn group_quorum_boundary(
        storage in prop::collection::vec(reported_state(), 1..=40),
        min_groups_up_ratio in ratio(),
    ) {
        let groups = storage.len();
        let topology = FleetTopology::uniform(groups, 1);
        let policy = GenerationPolicy { min_groups_up_ratio, ..Default::default() };
        let distributors = vec![State::Up; groups];
        let mut registry = registry_for(&topology, &distributors, &storage);
        let bundle = generate(&registry.snapshot(), &topology, &policy, &ContentClusterStats::new()).unwrap();

        let healthy = healthy_groups(&topology, &storage);
        let storage_up = storage.iter().filter(|s| s.is_available()).count();
        let expected_up = storage_up >= 1 && meets_group_quorum(healthy, groups, min_groups_up_ratio);
        prop_assert_eq!(bundle.baseline.state.is_cluster_up(), expected_up);
    }

    /// Generation is deterministic and derived states never exceed the
    /// baseline
    #[test]
    fn derived_states_are_restrictions((groups, per_group, distributors, storage) in fleet()) {
        let topology = FleetTopology::uniform(groups, per_group);
        let policy = GenerationPolicy::default();
        let mut registry = registry_for(&topology, &distributors, &storage);
        for index in 0..storage.len() {
            let report = HealthReport::new(Node::storage(index as u16), State::Maintenance, 1)
                .in_bucket_space("global");
            registry.report(&report).unwrap();
        }
        let snapshot = registry.snapshot();
        let stats = ContentClusterStats::new();
        let first = generate(&snapshot, &topology, &policy, &stats).unwrap();
        let second = generate(&snapshot, &topology, &policy, &stats).unwrap();
        prop_assert_eq!(&first, &second);

        for derived in first.derived.values() {
            for (node, state) in derived.state.nodes() {
                prop_assert!(!first.baseline.state.node_state(node).is_more_restrictive_than(state));
            }
        }
    }
}
