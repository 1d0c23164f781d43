//! Annotated cluster states and the published bundle.

use crate::error::{ControllerError, Result};
use crate::state::{ClusterState, Node, State};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a node's effective state differs from what it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    /// No health report has been received since the controller started
    NeverReported,
    /// Operator override, with the operator's reason text
    WantedState(String),
    /// The node's group has too few available storage nodes
    GroupAvailabilityBelowMinimum {
        group: String,
        available: usize,
        total: usize,
    },
    /// Retired storage node that no longer holds any buckets
    RetiredDrained,
    /// Control traffic to the node repeatedly failed
    Unreachable,
    /// Restricted in one bucket space only
    BucketSpaceOverride(String),
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverReported => write!(f, "no health report received"),
            Self::WantedState(reason) => write!(f, "wanted state: {}", reason),
            Self::GroupAvailabilityBelowMinimum {
                group,
                available,
                total,
            } => write!(
                f,
                "group '{}' availability below minimum ({}/{} storage nodes available)",
                group, available, total
            ),
            Self::RetiredDrained => write!(f, "retired node holds no buckets"),
            Self::Unreachable => write!(f, "node does not respond to control traffic"),
            Self::BucketSpaceOverride(space) => {
                write!(f, "restricted in bucket space '{}'", space)
            }
        }
    }
}

/// A `ClusterState` plus the reasons for every overridden node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatedClusterState {
    pub state: ClusterState,
    pub reasons: BTreeMap<Node, StateReason>,
    /// Set when the cluster-level state is down
    pub cluster_reason: Option<String>,
}

impl AnnotatedClusterState {
    pub fn new(
        state: ClusterState,
        reasons: BTreeMap<Node, StateReason>,
        cluster_reason: Option<String>,
    ) -> Self {
        Self {
            state,
            reasons,
            cluster_reason,
        }
    }

    pub fn without_annotations(state: ClusterState) -> Self {
        Self::new(state, BTreeMap::new(), None)
    }

    pub fn reason(&self, node: Node) -> Option<&StateReason> {
        self.reasons.get(&node)
    }
}

/// The unit of publication: a baseline state plus per bucket space derived
/// states, all sharing one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateBundle {
    pub version: u64,
    /// Milliseconds since the Unix epoch when the bundle was versioned
    pub generated_at_ms: u64,
    pub baseline: AnnotatedClusterState,
    pub derived: BTreeMap<String, AnnotatedClusterState>,
}

impl ClusterStateBundle {
    /// Build a bundle; the version is taken from the baseline state
    pub fn new(
        baseline: AnnotatedClusterState,
        derived: BTreeMap<String, AnnotatedClusterState>,
    ) -> Self {
        Self {
            version: baseline.state.version,
            generated_at_ms: 0,
            baseline,
            derived,
        }
    }

    pub fn of_baseline(baseline: AnnotatedClusterState) -> Self {
        Self::new(baseline, BTreeMap::new())
    }

    /// A copy of this bundle with every state set to `version`
    pub fn with_version(&self, version: u64, generated_at_ms: u64) -> Self {
        let mut bundle = self.clone();
        bundle.version = version;
        bundle.generated_at_ms = generated_at_ms;
        bundle.baseline.state.version = version;
        for derived in bundle.derived.values_mut() {
            derived.state.version = version;
        }
        bundle
    }

    /// State for a bucket space, falling back to the baseline
    pub fn state_for(&self, bucket_space: &str) -> &ClusterState {
        self.derived
            .get(bucket_space)
            .map(|s| &s.state)
            .unwrap_or(&self.baseline.state)
    }

    /// Whether both bundles publish the same states, ignoring version,
    /// timestamp and annotations
    pub fn similar_to(&self, other: &ClusterStateBundle) -> bool {
        self.baseline.state.same_states(&other.baseline.state)
            && self.derived.len() == other.derived.len()
            && self.derived.iter().all(|(space, state)| {
                other
                    .derived
                    .get(space)
                    .is_some_and(|o| o.state.same_states(&state.state))
            })
    }

    /// Check version consistency and that every derived state is a
    /// restriction of the baseline.
    pub fn validate(&self) -> Result<()> {
        let baseline = &self.baseline.state;
        if baseline.version != self.version {
            return Err(ControllerError::InvariantViolation(format!(
                "baseline version {} differs from bundle version {}",
                baseline.version, self.version
            )));
        }
        if !matches!(baseline.cluster, State::Up | State::Down) {
            return Err(ControllerError::InvariantViolation(format!(
                "cluster-level state must be up or down, was {}",
                baseline.cluster
            )));
        }

        for (space, derived) in &self.derived {
            let state = &derived.state;
            if state.version != self.version {
                return Err(ControllerError::InvariantViolation(format!(
                    "bucket space '{}' has version {}, bundle has {}",
                    space, state.version, self.version
                )));
            }
            if state.is_cluster_up() && !baseline.is_cluster_up() {
                return Err(ControllerError::InvariantViolation(format!(
                    "bucket space '{}' is up while the baseline cluster is down",
                    space
                )));
            }
            for (node, node_state) in state.nodes() {
                let Some(base) = baseline.get(node) else {
                    return Err(ControllerError::InvariantViolation(format!(
                        "bucket space '{}' contains {} which is not in the baseline",
                        space, node
                    )));
                };
                if node_state.is_more_restrictive_than(base) || node_state == base {
                    if node.kind.is_bucket_space_independent() && node_state != base {
                        return Err(ControllerError::InvariantViolation(format!(
                            "{} is {} in bucket space '{}' but {} in the baseline",
                            node, node_state, space, base
                        )));
                    }
                    continue;
                }
                return Err(ControllerError::InvariantViolation(format!(
                    "{} is {} in bucket space '{}' but only {} in the baseline",
                    node, node_state, space, base
                )));
            }
            for (node, _) in baseline.nodes() {
                if state.get(node).is_none() {
                    return Err(ControllerError::InvariantViolation(format!(
                        "bucket space '{}' is missing {}",
                        space, node
                    )));
                }
            }
        }
        Ok(())
    }

    /// Self-describing JSON form pushed to nodes and clients
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for ClusterStateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.baseline.state)?;
        for (space, derived) in &self.derived {
            write!(f, " | {}: {}", space, derived.state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a bundle from compact state strings, one per bucket space
    pub(crate) fn make_bundle(baseline: &str, spaces: &[(&str, &str)]) -> ClusterStateBundle {
        let baseline = AnnotatedClusterState::without_annotations(baseline.parse().unwrap());
        let derived = spaces
            .iter()
            .map(|(space, state)| {
                (
                    space.to_string(),
                    AnnotatedClusterState::without_annotations(state.parse().unwrap()),
                )
            })
            .collect();
        ClusterStateBundle::new(baseline, derived)
    }

    #[test]
    fn test_restriction_is_valid() {
        let bundle = make_bundle(
            "version:4 distributor:3 storage:3 .1.s:d",
            &[("global", "version:4 distributor:3 storage:3 .0.s:m .1.s:d")],
        );
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn test_expansion_is_invariant_violation() {
        let bundle = make_bundle(
            "version:4 distributor:3 storage:3 .1.s:d",
            &[("default", "version:4 distributor:3 storage:3")],
        );
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, ControllerError::InvariantViolation(_)));
    }

    #[test]
    fn test_distributor_override_is_invariant_violation() {
        let bundle = make_bundle(
            "version:1 distributor:2 storage:2",
            &[("global", "version:1 distributor:2 .0.s:d storage:2")],
        );
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_space_up_with_cluster_down_is_invalid() {
        let bundle = make_bundle(
            "version:2 cluster:d distributor:1 storage:1",
            &[("default", "version:2 distributor:1 storage:1")],
        );
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_version_mismatch_is_invalid() {
        let bundle = make_bundle(
            "version:2 distributor:1 storage:1",
            &[("default", "version:1 distributor:1 storage:1")],
        );
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_with_version_updates_all_states() {
        let bundle = make_bundle(
            "distributor:1 storage:1",
            &[("default", "distributor:1 storage:1")],
        )
        .with_version(12, 1_000);
        assert_eq!(bundle.version, 12);
        assert_eq!(bundle.generated_at_ms, 1_000);
        assert_eq!(bundle.baseline.state.version, 12);
        assert_eq!(bundle.state_for("default").version, 12);
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn test_similar_to_ignores_version_and_annotations() {
        let a = make_bundle("version:1 storage:2 .1.s:d", &[]);
        let mut b = make_bundle("version:5 storage:2 .1.s:d", &[]);
        b.baseline
            .reasons
            .insert(Node::storage(1), StateReason::NeverReported);
        assert!(a.similar_to(&b));
        let c = make_bundle("version:5 storage:2", &[]);
        assert!(!a.similar_to(&c));
    }

    #[test]
    fn test_json_form_is_self_describing() {
        let mut bundle = make_bundle(
            "version:3 distributor:2 storage:2 .1.s:d",
            &[("global", "version:3 distributor:2 storage:2 .0.s:m .1.s:d")],
        );
        bundle
            .baseline
            .reasons
            .insert(Node::storage(1), StateReason::WantedState("disk swap".into()));
        let json = bundle.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], 3);
        assert_eq!(value["baseline"]["state"]["storage"]["1"], "down");
        assert_eq!(value["derived"]["global"]["state"]["storage"]["0"], "maintenance");
        assert_eq!(ClusterStateBundle::from_json(&json).unwrap(), bundle);
    }
}
