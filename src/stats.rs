//! Fleet statistics aggregator.
//!
//! Holds the latest per storage node bucket and document counts. A refresh
//! replaces the whole snapshot at once; nodes missing from a refresh keep
//! their previous entry, so "never reported" and "reported empty" remain
//! distinguishable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts for one bucket space on one storage node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpaceStats {
    pub bucket_count: u64,
    pub document_count: u64,
    /// Buckets still waiting for merges
    pub buckets_pending: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentNodeStats {
    pub index: u16,
    pub spaces: BTreeMap<String, BucketSpaceStats>,
    /// Refresh cycle this entry was last reported in
    #[serde(default)]
    pub refreshed_in_cycle: u64,
}

impl ContentNodeStats {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            spaces: BTreeMap::new(),
            refreshed_in_cycle: 0,
        }
    }

    pub fn with_space(mut self, space: &str, stats: BucketSpaceStats) -> Self {
        self.spaces.insert(space.to_string(), stats);
        self
    }

    pub fn total_buckets(&self) -> u64 {
        self.spaces.values().map(|s| s.bucket_count).sum()
    }

    /// Reported, and holds no bucket in any space
    pub fn is_empty(&self) -> bool {
        !self.spaces.is_empty() && self.total_buckets() == 0
    }
}

/// Stats for all storage nodes, keyed by node index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentClusterStats {
    nodes: BTreeMap<u16, ContentNodeStats>,
}

impl ContentClusterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes<I: IntoIterator<Item = ContentNodeStats>>(nodes: I) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.index, n)).collect(),
        }
    }

    /// `None` when the node has never reported statistics
    pub fn node(&self, index: u16) -> Option<&ContentNodeStats> {
        self.nodes.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContentNodeStats> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Owner of the current statistics snapshot.
#[derive(Debug, Default)]
pub struct FleetStats {
    current: Arc<ContentClusterStats>,
    cycle: u64,
}

impl FleetStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one refresh cycle and swap in the new snapshot
    pub fn refresh(&mut self, update: ContentClusterStats) -> Arc<ContentClusterStats> {
        self.cycle += 1;
        let mut next = (*self.current).clone();
        for mut node in update.nodes.into_values() {
            node.refreshed_in_cycle = self.cycle;
            next.nodes.insert(node.index, node);
        }
        self.current = Arc::new(next);
        tracing::debug!(cycle = self.cycle, nodes = self.current.len(), "statistics refreshed");
        Arc::clone(&self.current)
    }

    /// Drop a node removed from the fleet configuration
    pub fn remove(&mut self, index: u16) {
        if self.current.node(index).is_some() {
            let mut next = (*self.current).clone();
            next.nodes.remove(&index);
            self.current = Arc::new(next);
        }
    }

    pub fn snapshot(&self) -> Arc<ContentClusterStats> {
        Arc::clone(&self.current)
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(index: u16, buckets: u64) -> ContentNodeStats {
        ContentNodeStats::new(index).with_space(
            "default",
            BucketSpaceStats {
                bucket_count: buckets,
                document_count: buckets * 10,
                buckets_pending: 0,
            },
        )
    }

    #[test]
    fn test_never_reported_vs_empty() {
        let mut fleet = FleetStats::new();
        fleet.refresh(ContentClusterStats::from_nodes([stats(0, 0)]));
        let snapshot = fleet.snapshot();
        assert!(snapshot.node(0).unwrap().is_empty());
        assert!(snapshot.node(1).is_none());
        assert!(!ContentNodeStats::new(2).is_empty());
    }

    #[test]
    fn test_refresh_retains_absent_nodes() {
        let mut fleet = FleetStats::new();
        fleet.refresh(ContentClusterStats::from_nodes([stats(0, 5), stats(1, 7)]));
        fleet.refresh(ContentClusterStats::from_nodes([stats(1, 9)]));
        let snapshot = fleet.snapshot();
        assert_eq!(snapshot.node(0).unwrap().total_buckets(), 5);
        assert_eq!(snapshot.node(0).unwrap().refreshed_in_cycle, 1);
        assert_eq!(snapshot.node(1).unwrap().total_buckets(), 9);
        assert_eq!(snapshot.node(1).unwrap().refreshed_in_cycle, 2);
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_refresh() {
        let mut fleet = FleetStats::new();
        fleet.refresh(ContentClusterStats::from_nodes([stats(0, 5)]));
        let before = fleet.snapshot();
        fleet.refresh(ContentClusterStats::from_nodes([stats(0, 0)]));
        assert_eq!(before.node(0).unwrap().total_buckets(), 5);
        assert_eq!(fleet.snapshot().node(0).unwrap().total_buckets(), 0);
    }

    #[test]
    fn test_remove() {
        let mut fleet = FleetStats::new();
        fleet.refresh(ContentClusterStats::from_nodes([stats(0, 5), stats(1, 1)]));
        fleet.remove(0);
        assert!(fleet.snapshot().node(0).is_none());
        assert_eq!(fleet.snapshot().len(), 1);
    }
}
