//! Node identity and node state definitions.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Kind of content node process.
///
/// Distributors are bucket space independent: their state is identical in
/// every bucket space. Only storage nodes can be restricted per space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Distributor,
    Storage,
}

impl NodeKind {
    pub const ALL: [NodeKind; 2] = [NodeKind::Distributor, NodeKind::Storage];

    /// Whether nodes of this kind share one state across all bucket spaces
    pub fn is_bucket_space_independent(self) -> bool {
        matches!(self, Self::Distributor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distributor => "distributor",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "distributor" => Ok(Self::Distributor),
            "storage" => Ok(Self::Storage),
            other => Err(format!("unknown node kind '{}'", other)),
        }
    }
}

/// A content node: `(kind, index)`.
///
/// Serialized as its display form (`storage.3`) so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub kind: NodeKind,
    pub index: u16,
}

impl Node {
    pub fn new(kind: NodeKind, index: u16) -> Self {
        Self { kind, index }
    }

    pub fn distributor(index: u16) -> Self {
        Self::new(NodeKind::Distributor, index)
    }

    pub fn storage(index: u16) -> Self {
        Self::new(NodeKind::Storage, index)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.index)
    }
}

impl FromStr for Node {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = s
            .split_once('.')
            .ok_or_else(|| format!("expected KIND.INDEX, got '{}'", s))?;
        let index = index
            .parse::<u16>()
            .map_err(|_| format!("invalid node index in '{}'", s))?;
        Ok(Self::new(kind.parse()?, index))
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// State of a node (or of the cluster as a whole).
///
/// `Retired` is never reported by a node. It is the generated "retired but
/// usable" state of a storage node scheduled for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Up,
    Initializing,
    Stopping,
    Down,
    Maintenance,
    Retired,
}

impl State {
    /// Availability rank, higher is more available. Every state has a
    /// distinct rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Up => 5,
            Self::Retired => 4,
            Self::Initializing => 3,
            Self::Stopping => 2,
            Self::Maintenance => 1,
            Self::Down => 0,
        }
    }

    /// Whether a node in this state counts towards group and cluster availability
    pub fn is_available(self) -> bool {
        matches!(self, Self::Up | Self::Retired | Self::Initializing)
    }

    pub fn is_more_restrictive_than(self, other: State) -> bool {
        self.rank() < other.rank()
    }

    /// Single letter code used by the compact cluster state format
    pub fn code(self) -> char {
        match self {
            Self::Up => 'u',
            Self::Initializing => 'i',
            Self::Stopping => 's',
            Self::Down => 'd',
            Self::Maintenance => 'm',
            Self::Retired => 'r',
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "u" => Some(Self::Up),
            "i" => Some(Self::Initializing),
            "s" => Some(Self::Stopping),
            "d" => Some(Self::Down),
            "m" => Some(Self::Maintenance),
            "r" => Some(Self::Retired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Initializing => "initializing",
            Self::Stopping => "stopping",
            Self::Down => "down",
            Self::Maintenance => "maintenance",
            Self::Retired => "retired",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        if let Some(state) = Self::from_code(&lower) {
            return Ok(state);
        }
        match lower.as_str() {
            "up" => Ok(Self::Up),
            "initializing" => Ok(Self::Initializing),
            "stopping" => Ok(Self::Stopping),
            "down" => Ok(Self::Down),
            "maintenance" => Ok(Self::Maintenance),
            "retired" => Ok(Self::Retired),
            other => Err(format!("unknown state '{}'", other)),
        }
    }
}
