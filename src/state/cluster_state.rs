//! Versioned cluster state and its compact textual form.
//!
//! The textual form lists the cluster-level state and, per node kind, the
//! node count followed by every node that is not `Up`:
//!
//! ```text
//! version:3 cluster:d distributor:4 .2.s:d storage:4 .1.s:m .2.s:d
//! ```
//!
//! The count after `distributor:`/`storage:` is the highest index plus one.
//! Indices below the count that are not present in the state are written
//! as down, so parsing yields an explicit entry for every index.

use crate::error::{ControllerError, Result};
use crate::state::{Node, NodeKind, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    /// Cluster-level state, either `Up` or `Down`
    pub cluster: State,
    pub distributors: BTreeMap<u16, State>,
    pub storage: BTreeMap<u16, State>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    /// Create an empty, available cluster state at version 0
    pub fn new() -> Self {
        Self {
            version: 0,
            cluster: State::Up,
            distributors: BTreeMap::new(),
            storage: BTreeMap::new(),
        }
    }

    pub fn is_cluster_up(&self) -> bool {
        self.cluster == State::Up
    }

    fn nodes_of(&self, kind: NodeKind) -> &BTreeMap<u16, State> {
        match kind {
            NodeKind::Distributor => &self.distributors,
            NodeKind::Storage => &self.storage,
        }
    }

    fn nodes_of_mut(&mut self, kind: NodeKind) -> &mut BTreeMap<u16, State> {
        match kind {
            NodeKind::Distributor => &mut self.distributors,
            NodeKind::Storage => &mut self.storage,
        }
    }

    /// State of a node, `None` if the node is not part of this state
    pub fn get(&self, node: Node) -> Option<State> {
        self.nodes_of(node.kind).get(&node.index).copied()
    }

    /// State of a node; nodes absent from the state are down
    pub fn node_state(&self, node: Node) -> State {
        self.get(node).unwrap_or(State::Down)
    }

    pub fn set_node_state(&mut self, node: Node, state: State) {
        self.nodes_of_mut(node.kind).insert(node.index, state);
    }

    /// All nodes in index order, distributors first
    pub fn nodes(&self) -> impl Iterator<Item = (Node, State)> + '_ {
        let distributors = self
            .distributors
            .iter()
            .map(|(i, s)| (Node::distributor(*i), *s));
        let storage = self.storage.iter().map(|(i, s)| (Node::storage(*i), *s));
        distributors.chain(storage)
    }

    pub fn node_count(&self, kind: NodeKind) -> usize {
        self.nodes_of(kind).len()
    }

    pub fn available_count(&self, kind: NodeKind) -> usize {
        self.nodes_of(kind)
            .values()
            .filter(|s| s.is_available())
            .count()
    }

    /// Whether both states describe the same cluster and node states,
    /// regardless of version
    pub fn same_states(&self, other: &ClusterState) -> bool {
        self.cluster == other.cluster
            && self.distributors == other.distributors
            && self.storage == other.storage
    }

    fn write_kind(&self, f: &mut fmt::Formatter<'_>, kind: NodeKind) -> fmt::Result {
        let nodes = self.nodes_of(kind);
        let Some(max_index) = nodes.keys().next_back() else {
            return Ok(());
        };
        let count = u32::from(*max_index) + 1;
        write!(f, " {}:{}", kind, count)?;
        for index in 0..count {
            // count never exceeds u16::MAX + 1, so index fits in u16
            let index = index as u16;
            let state = nodes.get(&index).copied().unwrap_or(State::Down);
            if state != State::Up {
                write!(f, " .{}.s:{}", index, state.code())?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version:{}", self.version)?;
        if !self.is_cluster_up() {
            write!(f, " cluster:{}", self.cluster.code())?;
        }
        self.write_kind(f, NodeKind::Distributor)?;
        self.write_kind(f, NodeKind::Storage)
    }
}

impl FromStr for ClusterState {
    type Err = ControllerError;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: String| ControllerError::InvalidStateString {
            input: input.to_string(),
            reason,
        };

        let mut state = ClusterState::new();
        let mut current: Option<NodeKind> = None;

        for token in input.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| invalid(format!("token '{}' has no value", token)))?;

            if let Some(rest) = key.strip_prefix('.') {
                let kind = current
                    .ok_or_else(|| invalid(format!("node token '{}' before node kind", token)))?;
                let (index, attribute) = rest
                    .split_once('.')
                    .ok_or_else(|| invalid(format!("malformed node token '{}'", token)))?;
                let index: u16 = index
                    .parse()
                    .map_err(|_| invalid(format!("invalid node index in '{}'", token)))?;
                if !state.nodes_of(kind).contains_key(&index) {
                    return Err(invalid(format!("node index {} out of range", index)));
                }
                // Only the state attribute is carried by this format
                if attribute == "s" {
                    let node_state = State::from_code(value)
                        .ok_or_else(|| invalid(format!("unknown state code '{}'", value)))?;
                    state.set_node_state(Node::new(kind, index), node_state);
                }
                continue;
            }

            match key {
                "version" => {
                    state.version = value
                        .parse()
                        .map_err(|_| invalid(format!("invalid version '{}'", value)))?;
                }
                "cluster" => {
                    state.cluster = match State::from_code(value) {
                        Some(s @ (State::Up | State::Down)) => s,
                        _ => return Err(invalid(format!("invalid cluster state '{}'", value))),
                    };
                }
                "distributor" | "storage" => {
                    let kind: NodeKind = key.parse().map_err(invalid)?;
                    let count: u32 = value
                        .parse()
                        .map_err(|_| invalid(format!("invalid node count '{}'", value)))?;
                    if count > u32::from(u16::MAX) + 1 {
                        return Err(invalid(format!("node count {} too large", count)));
                    }
                    let nodes = state.nodes_of_mut(kind);
                    nodes.clear();
                    for index in 0..count {
                        nodes.insert(index as u16, State::Up);
                    }
                    current = Some(kind);
                }
                "bits" => {}
                other => return Err(invalid(format!("unknown key '{}'", other))),
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_state() {
        let state: ClusterState = "version:3 distributor:4 .2.s:d storage:4 .1.s:m"
            .parse()
            .unwrap();
        assert_eq!(state.version, 3);
        assert!(state.is_cluster_up());
        assert_eq!(state.node_state(Node::distributor(2)), State::Down);
        assert_eq!(state.node_state(Node::storage(1)), State::Maintenance);
        assert_eq!(state.node_state(Node::storage(3)), State::Up);
        assert_eq!(state.node_count(NodeKind::Storage), 4);
        assert_eq!(state.available_count(NodeKind::Storage), 3);
    }

    #[test]
    fn test_display_lists_non_up_nodes() {
        let mut state: ClusterState = "distributor:3 storage:3".parse().unwrap();
        state.version = 7;
        state.cluster = State::Down;
        state.set_node_state(Node::storage(0), State::Retired);
        state.set_node_state(Node::distributor(2), State::Initializing);
        assert_eq!(
            state.to_string(),
            "version:7 cluster:d distributor:3 .2.s:i storage:3 .0.s:r"
        );
    }

    #[test]
    fn test_display_writes_gaps_as_down() {
        let mut state = ClusterState::new();
        state.set_node_state(Node::storage(0), State::Up);
        state.set_node_state(Node::storage(2), State::Up);
        assert_eq!(state.to_string(), "version:0 storage:3 .1.s:d");
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!("version:x".parse::<ClusterState>().is_err());
        assert!(".1.s:d storage:2".parse::<ClusterState>().is_err());
        assert!("storage:2 .5.s:d".parse::<ClusterState>().is_err());
        assert!("storage:2 .1.s:q".parse::<ClusterState>().is_err());
        assert!("cluster:m".parse::<ClusterState>().is_err());
        assert!("flavour:2".parse::<ClusterState>().is_err());
    }

    #[test]
    fn test_same_states_ignores_version() {
        let a: ClusterState = "version:1 storage:2 .0.s:d".parse().unwrap();
        let b: ClusterState = "version:9 storage:2 .0.s:d".parse().unwrap();
        let c: ClusterState = "version:9 storage:2".parse().unwrap();
        assert!(a.same_states(&b));
        assert!(!a.same_states(&c));
    }
}
