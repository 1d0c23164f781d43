//! Cluster state controller for a fleet of distributor and storage nodes.
//!
//! Health reports flow into a [`registry::NodeHealthRegistry`], the
//! [`generator`] turns a registry snapshot into a candidate
//! [`state::ClusterStateBundle`], the [`governor`] decides when a candidate
//! may be published, and the [`broadcast`] dispatcher pushes every published
//! version to nodes and registered clients. Only the instance holding the
//! coordination lease publishes.

pub mod broadcast;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod generator;
pub mod governor;
pub mod observability;
pub mod registry;
pub mod state;
pub mod stats;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerHandle, StatusSnapshot};
pub use error::{ControllerError, Result};
pub use registry::{HealthReport, ReportOutcome};
pub use state::{ClusterState, ClusterStateBundle, Node, NodeKind, State};
