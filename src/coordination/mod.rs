//! Leadership and version persistence.
//!
//! A [`CoordinationStore`] holds the leadership lease and the last published
//! bundle. The [`LeaderCoordinator`] wraps a store for one controller
//! instance and tracks whether that instance may publish.

mod file;
mod leader;
mod memory;

pub use file::FileCoordinationStore;
pub use leader::{LeaderCoordinator, LeaderTerm, Leadership, Takeover};
pub use memory::MemoryCoordinationStore;

use crate::error::Result;
use crate::state::ClusterStateBundle;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Granted,
    /// Held by another instance
    Denied { holder: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRenewal {
    Renewed,
    /// Expired or taken over by another instance
    Lost,
}

/// Shared store backing leader election and version persistence.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn try_acquire_lease(&self, id: &str, ttl: Duration) -> Result<LeaseGrant>;

    async fn renew_lease(&self, id: &str) -> Result<LeaseRenewal>;

    async fn release_lease(&self, id: &str) -> Result<()>;

    /// Highest version ever written, 0 if none
    async fn read_last_version(&self) -> Result<u64>;

    async fn read_last_published(&self) -> Result<Option<ClusterStateBundle>>;

    /// Persist a publication. Versions that do not exceed the stored one
    /// are rejected.
    async fn write_last_published(&self, version: u64, bundle: &ClusterStateBundle) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    ttl: Duration,
    expires_at: Instant,
}

/// Lease bookkeeping shared by the store implementations
#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
    lease: Option<Lease>,
}

impl LeaseTable {
    pub(crate) fn try_acquire(&mut self, id: &str, ttl: Duration, now: Instant) -> LeaseGrant {
        if let Some(lease) = &self.lease {
            if lease.holder != id && lease.expires_at > now {
                return LeaseGrant::Denied {
                    holder: lease.holder.clone(),
                };
            }
        }
        self.lease = Some(Lease {
            holder: id.to_string(),
            ttl,
            expires_at: now + ttl,
        });
        LeaseGrant::Granted
    }

    pub(crate) fn renew(&mut self, id: &str, now: Instant) -> LeaseRenewal {
        match &mut self.lease {
            Some(lease) if lease.holder == id && lease.expires_at > now => {
                lease.expires_at = now + lease.ttl;
                LeaseRenewal::Renewed
            }
            _ => LeaseRenewal::Lost,
        }
    }

    pub(crate) fn release(&mut self, id: &str) {
        if self.lease.as_ref().is_some_and(|l| l.holder == id) {
            self.lease = None;
        }
    }

    pub(crate) fn holder(&self, now: Instant) -> Option<&str> {
        self.lease
            .as_ref()
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_exclusive_until_expiry() {
        let mut table = LeaseTable::default();
        let now = Instant::now();
        let ttl = Duration::from_secs(10);
        assert_eq!(table.try_acquire("a", ttl, now), LeaseGrant::Granted);
        assert_eq!(
            table.try_acquire("b", ttl, now + Duration::from_secs(5)),
            LeaseGrant::Denied { holder: "a".into() }
        );
        assert_eq!(
            table.try_acquire("b", ttl, now + Duration::from_secs(10)),
            LeaseGrant::Granted
        );
        assert_eq!(table.renew("a", now + Duration::from_secs(11)), LeaseRenewal::Lost);
        assert_eq!(table.holder(now + Duration::from_secs(11)), Some("b"));
    }

    #[test]
    fn test_renew_extends_and_release_clears() {
        let mut table = LeaseTable::default();
        let now = Instant::now();
        let ttl = Duration::from_secs(10);
        table.try_acquire("a", ttl, now);
        assert_eq!(table.renew("a", now + Duration::from_secs(9)), LeaseRenewal::Renewed);
        assert_eq!(table.holder(now + Duration::from_secs(15)), Some("a"));
        table.release("b");
        assert_eq!(table.holder(now), Some("a"));
        table.release("a");
        assert_eq!(table.holder(now), None);
    }
}
