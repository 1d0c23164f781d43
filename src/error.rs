use thiserror::Error;

use crate::state::{Node, State};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown node: {0}")]
    UnknownNode(Node),

    #[error("Invalid health report for {node}: {reason}")]
    InvalidReport { node: Node, reason: String },

    #[error("Invalid wanted state {state} for {node}")]
    InvalidTransition { node: Node, state: State },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Invalid cluster state string '{input}': {reason}")]
    InvalidStateString { input: String, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Leadership lease lost: {0}")]
    LeaseLost(String),

    #[error("Not leader")]
    NotLeader,

    #[error("Coordination store error: {0}")]
    Coordination(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Controller is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ControllerError>;
