//! Controller configuration.
//!
//! Configuration is read from a TOML file. Every section and field has a
//! default, so an empty file yields a runnable (if empty) fleet. Durations
//! are given in milliseconds.
//!
//! ```toml
//! [controller]
//! id = "controller-0"
//!
//! [fleet]
//! bucket_spaces = ["default", "global"]
//!
//! [[fleet.groups]]
//! name = "group0"
//! nodes = [{ index = 0 }, { index = 1 }, { index = 2, retired = true }]
//!
//! [policy]
//! min_node_ratio_per_group = 0.75
//!
//! [transition]
//! stabilization_window_ms = 30000
//! ```

use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One configured node index; a distributor and a storage node run on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub index: u16,
    /// Scheduled for removal: keeps serving, receives no new data
    #[serde(default)]
    pub retired: bool,
}

/// A redundancy group of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Overrides `policy.min_node_ratio_per_group` for this group
    #[serde(default)]
    pub min_node_ratio: Option<f64>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Static fleet topology: groups, nodes and bucket spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetTopology {
    #[serde(default = "default_bucket_spaces")]
    pub bucket_spaces: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_bucket_spaces() -> Vec<String> {
    vec!["default".to_string(), "global".to_string()]
}

impl Default for FleetTopology {
    fn default() -> Self {
        Self {
            bucket_spaces: default_bucket_spaces(),
            groups: Vec::new(),
        }
    }
}

impl FleetTopology {
    /// `groups` groups of `nodes_per_group` nodes each, indexed consecutively
    pub fn uniform(groups: usize, nodes_per_group: usize) -> Self {
        let groups = (0..groups)
            .map(|g| GroupConfig {
                name: format!("group{}", g),
                min_node_ratio: None,
                nodes: (0..nodes_per_group)
                    .map(|n| NodeConfig {
                        index: (g * nodes_per_group + n) as u16,
                        retired: false,
                    })
                    .collect(),
            })
            .collect();
        Self {
            bucket_spaces: default_bucket_spaces(),
            groups,
        }
    }

    /// A single group of `nodes` nodes
    pub fn flat(nodes: usize) -> Self {
        Self::uniform(1, nodes)
    }

    pub fn with_bucket_spaces(mut self, spaces: &[&str]) -> Self {
        self.bucket_spaces = spaces.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Mark a configured index as retired
    pub fn with_retired(mut self, index: u16) -> Self {
        for node in self.groups.iter_mut().flat_map(|g| g.nodes.iter_mut()) {
            if node.index == index {
                node.retired = true;
            }
        }
        self
    }

    /// All node indices in configuration order
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.groups
            .iter()
            .flat_map(|g| g.nodes.iter().map(|n| n.index))
    }

    pub fn node(&self, index: u16) -> Option<(&GroupConfig, &NodeConfig)> {
        self.groups
            .iter()
            .find_map(|g| g.nodes.iter().find(|n| n.index == index).map(|n| (g, n)))
    }

    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|g| g.nodes.len()).sum()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for group in &self.groups {
            if let Some(ratio) = group.min_node_ratio {
                validate_ratio(&format!("fleet.groups[{}].min_node_ratio", group.name), ratio)?;
            }
            for node in &group.nodes {
                if !seen.insert(node.index) {
                    return Err(ControllerError::Config(format!(
                        "node index {} is configured more than once",
                        node.index
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Availability thresholds used by the state generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPolicy {
    /// A group whose available storage ratio falls below this is taken down
    #[serde(default)]
    pub min_node_ratio_per_group: f64,
    #[serde(default = "default_min_up")]
    pub min_distributors_up: usize,
    #[serde(default = "default_min_up")]
    pub min_storage_up: usize,
    #[serde(default)]
    pub min_distributor_up_ratio: f64,
    #[serde(default)]
    pub min_storage_up_ratio: f64,
    /// Required fraction of healthy groups; `ceil(ratio * groups)` must be healthy
    #[serde(default)]
    pub min_groups_up_ratio: f64,
}

fn default_min_up() -> usize {
    1
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            min_node_ratio_per_group: 0.0,
            min_distributors_up: default_min_up(),
            min_storage_up: default_min_up(),
            min_distributor_up_ratio: 0.0,
            min_storage_up_ratio: 0.0,
            min_groups_up_ratio: 0.0,
        }
    }
}

impl GenerationPolicy {
    fn validate(&self) -> Result<()> {
        validate_ratio("policy.min_node_ratio_per_group", self.min_node_ratio_per_group)?;
        validate_ratio("policy.min_distributor_up_ratio", self.min_distributor_up_ratio)?;
        validate_ratio("policy.min_storage_up_ratio", self.min_storage_up_ratio)?;
        validate_ratio("policy.min_groups_up_ratio", self.min_groups_up_ratio)
    }
}

fn validate_ratio(name: &str, ratio: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&ratio) {
        return Err(ControllerError::Config(format!(
            "{} must be within [0, 1], was {}",
            name, ratio
        )));
    }
    Ok(())
}

/// Hysteresis settings for the transition governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionPolicy {
    /// How long a node must stay less available before it is published
    #[serde(default = "default_stabilization_window_ms")]
    pub stabilization_window_ms: u64,
    /// Minimum time between two published versions
    #[serde(default = "default_min_publication_interval_ms")]
    pub min_publication_interval_ms: u64,
    /// Consecutive available reports required before a node is published as up
    #[serde(default = "default_up_confirmation_reports")]
    pub up_confirmation_reports: u32,
}

fn default_stabilization_window_ms() -> u64 {
    30_000
}

fn default_min_publication_interval_ms() -> u64 {
    1_000
}

fn default_up_confirmation_reports() -> u32 {
    1
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            stabilization_window_ms: default_stabilization_window_ms(),
            min_publication_interval_ms: default_min_publication_interval_ms(),
            up_confirmation_reports: default_up_confirmation_reports(),
        }
    }
}

impl TransitionPolicy {
    pub fn stabilization_window(&self) -> Duration {
        Duration::from_millis(self.stabilization_window_ms)
    }

    pub fn min_publication_interval(&self) -> Duration {
        Duration::from_millis(self.min_publication_interval_ms)
    }
}

/// Control loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Nothing is published before every node has reported or this has elapsed
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_startup_grace_ms() -> u64 {
    5_000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

impl TimingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Broadcast retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Retries per delivery round after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Consecutive failed delivery rounds before a node is reported down
    #[serde(default = "default_unreachable_threshold")]
    pub unreachable_threshold: u32,
}

fn default_push_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_unreachable_threshold() -> u32 {
    3
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: default_push_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            unreachable_threshold: default_unreachable_threshold(),
        }
    }
}

impl BroadcastConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Which coordination store backs leadership and version persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local store, for tests and single-instance development
    #[default]
    Memory,
    /// Last publication persisted to a local file
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub store: StoreKind,
    /// State file for the `file` store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
    /// Upper bound for every coordination store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/cluster-state.json")
}

fn default_lease_ttl_ms() -> u64 {
    10_000
}

fn default_renew_interval_ms() -> u64 {
    3_000
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            path: default_store_path(),
            lease_ttl_ms: default_lease_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl CoordinationConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.renew_interval_ms.saturating_add(self.store_timeout_ms) >= self.lease_ttl_ms {
            return Err(ControllerError::Config(format!(
                "coordination.renew_interval_ms ({}) + store_timeout_ms ({}) must be below lease_ttl_ms ({})",
                self.renew_interval_ms, self.store_timeout_ms, self.lease_ttl_ms
            )));
        }
        if self.renew_interval_ms == 0 {
            return Err(ControllerError::Config(
                "coordination.renew_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format: text or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Identity used when competing for the leadership lease
    #[serde(default = "default_controller_id")]
    pub id: String,
}

fn default_controller_id() -> String {
    "controller-0".to_string()
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            id: default_controller_id(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub fleet: FleetTopology,
    #[serde(default)]
    pub policy: GenerationPolicy,
    #[serde(default)]
    pub transition: TransitionPolicy,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Create a configuration for a controller instance over a fleet
    ///
    /// # Example
    ///
    /// ```
    /// use clusterctl::config::{ControllerConfig, FleetTopology};
    ///
    /// let config = ControllerConfig::new("cc-1", FleetTopology::flat(4));
    /// assert_eq!(config.controller.id, "cc-1");
    /// assert_eq!(config.fleet.node_count(), 4);
    /// ```
    pub fn new<S: Into<String>>(id: S, fleet: FleetTopology) -> Self {
        Self {
            controller: ControllerSection { id: id.into() },
            fleet,
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.id.is_empty() {
            return Err(ControllerError::Config(
                "controller.id must not be empty".to_string(),
            ));
        }
        if self.timing.tick_interval_ms == 0 {
            return Err(ControllerError::Config(
                "timing.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.broadcast.push_timeout_ms == 0 {
            return Err(ControllerError::Config(
                "broadcast.push_timeout_ms must be positive".to_string(),
            ));
        }
        self.fleet.validate()?;
        self.policy.validate()?;
        self.coordination.validate()
    }

    pub fn with_policy(mut self, policy: GenerationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transition(mut self, transition: TransitionPolicy) -> Self {
        self.transition = transition;
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_broadcast(mut self, broadcast: BroadcastConfig) -> Self {
        self.broadcast = broadcast;
        self
    }

    pub fn with_coordination(mut self, coordination: CoordinationConfig) -> Self {
        self.coordination = coordination;
        self
    }
}
