//! In-process coordination store.
//!
//! Every client created with [`MemoryCoordinationStore::clone_client`]
//! shares the same lease and publication record, so several controller
//! instances in one process compete for one lease. Each client can be cut
//! off from the store to simulate a partition.

use super::{CoordinationStore, LeaseGrant, LeaseRenewal, LeaseTable};
use crate::error::{ControllerError, Result};
use crate::state::ClusterStateBundle;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Inner {
    leases: LeaseTable,
    last_version: u64,
    /// bincode encoded bundle
    last_published: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MemoryCoordinationStore {
    inner: Arc<Mutex<Inner>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Another client of the same store with its own reachability switch
    pub fn clone_client(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Current lease holder, if the lease has not expired
    pub async fn lease_holder(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.leases.holder(Instant::now()).map(str::to_string)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ControllerError::Coordination(
                "coordination store unreachable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn try_acquire_lease(&self, id: &str, ttl: Duration) -> Result<LeaseGrant> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.leases.try_acquire(id, ttl, Instant::now()))
    }

    async fn renew_lease(&self, id: &str) -> Result<LeaseRenewal> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.leases.renew(id, Instant::now()))
    }

    async fn release_lease(&self, id: &str) -> Result<()> {
        self.check_reachable()?;
        self.inner.lock().await.leases.release(id);
        Ok(())
    }

    async fn read_last_version(&self) -> Result<u64> {
        self.check_reachable()?;
        Ok(self.inner.lock().await.last_version)
    }

    async fn read_last_published(&self) -> Result<Option<ClusterStateBundle>> {
        self.check_reachable()?;
        let inner = self.inner.lock().await;
        match &inner.last_published {
            Some(encoded) => Ok(Some(bincode::deserialize(encoded)?)),
            None => Ok(None),
        }
    }

    async fn write_last_published(&self, version: u64, bundle: &ClusterStateBundle) -> Result<()> {
        self.check_reachable()?;
        let encoded = bincode::serialize(bundle)?;
        let mut inner = self.inner.lock().await;
        if version <= inner.last_version {
            return Err(ControllerError::Coordination(format!(
                "version {} does not exceed stored version {}",
                version, inner.last_version
            )));
        }
        inner.last_version = version;
        inner.last_published = Some(encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::make_bundle;

    #[tokio::test]
    async fn test_clients_share_lease() {
        let a = MemoryCoordinationStore::new();
        let b = a.clone_client();
        let ttl = Duration::from_secs(10);
        assert_eq!(a.try_acquire_lease("a", ttl).await.unwrap(), LeaseGrant::Granted);
        assert!(matches!(
            b.try_acquire_lease("b", ttl).await.unwrap(),
            LeaseGrant::Denied { .. }
        ));
        a.release_lease("a").await.unwrap();
        assert_eq!(b.try_acquire_lease("b", ttl).await.unwrap(), LeaseGrant::Granted);
        assert_eq!(a.lease_holder().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_publication_round_trip_and_monotonic_versions() {
        let store = MemoryCoordinationStore::new();
        assert_eq!(store.read_last_version().await.unwrap(), 0);
        assert!(store.read_last_published().await.unwrap().is_none());

        let bundle = make_bundle(
            "version:5 distributor:2 storage:2 .1.s:d",
            &[("global", "version:5 distributor:2 storage:2 .1.s:d")],
        );
        store.write_last_published(5, &bundle).await.unwrap();
        assert_eq!(store.read_last_version().await.unwrap(), 5);
        assert_eq!(store.read_last_published().await.unwrap(), Some(bundle.clone()));
        assert!(store.write_last_published(5, &bundle).await.is_err());
        assert!(store.write_last_published(4, &bundle).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_client() {
        let a = MemoryCoordinationStore::new();
        let b = a.clone_client();
        b.set_reachable(false);
        assert!(matches!(
            b.read_last_version().await,
            Err(ControllerError::Coordination(_))
        ));
        assert_eq!(a.read_last_version().await.unwrap(), 0);
    }
}
