//! Bounded log of notable controller events, most recent first.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_EVENT_LOG_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeTransition,
    Publication,
    Leadership,
    RejectedCandidate,
    WantedState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerEvent {
    pub id: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub description: String,
}

#[derive(Debug)]
pub struct EventLog {
    entries: RwLock<VecDeque<ControllerEvent>>,
    max_len: usize,
    next_id: AtomicU64,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_LEN)
    }
}

impl EventLog {
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_len)),
            max_len,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn record<S: Into<String>>(&self, kind: EventKind, description: S) {
        let entry = ControllerEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: unix_millis(),
            kind,
            description: description.into(),
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push_front(entry);
        entries.truncate(self.max_len);
    }

    /// Up to `count` most recent events
    pub fn recent(&self, count: usize) -> Vec<ControllerEvent> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().take(count).cloned().collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<ControllerEvent> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
