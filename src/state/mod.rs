//! Cluster state data model.
//!
//! Everything here is a plain immutable value: a new version of the cluster
//! state is always a new `ClusterStateBundle`, never an edit of a published
//! one.

mod bundle;
mod cluster_state;
mod node;

pub use bundle::{AnnotatedClusterState, ClusterStateBundle, StateReason};
pub use cluster_state::ClusterState;
pub use node::{Node, NodeKind, State};

#[cfg(test)]
pub(crate) use bundle::tests::make_bundle;
