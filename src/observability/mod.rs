//! Observability: logging setup, metrics and the controller event log.

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{ControllerEvent, EventKind, EventLog};
pub use logging::{LogConfig, LogFormat};
pub use metrics::{ControllerMetrics, Counter, Gauge};
