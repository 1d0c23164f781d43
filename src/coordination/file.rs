//! Single-host coordination store.
//!
//! The last publication is kept in a JSON file that is replaced atomically
//! on every write, so a restarted controller resumes numbering above the
//! last published version. Leases live in memory: only controllers in the
//! same process can compete for leadership.

use super::{CoordinationStore, LeaseGrant, LeaseRenewal, LeaseTable};
use crate::error::{ControllerError, Result};
use crate::state::ClusterStateBundle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    last_version: u64,
    last_published: Option<ClusterStateBundle>,
}

#[derive(Debug)]
struct Inner {
    leases: LeaseTable,
    state: PersistedState,
}

#[derive(Debug, Clone)]
pub struct FileCoordinationStore {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
}

impl FileCoordinationStore {
    /// Open the store, loading the state file if it exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(
            path = %path.display(),
            last_version = state.last_version,
            "coordination state loaded"
        );
        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(Inner {
                leases: LeaseTable::default(),
                state,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write to a temporary file in the target directory, then rename it over
/// the state file
fn write_atomically(path: &Path, state: &PersistedState) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, state)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CoordinationStore for FileCoordinationStore {
    async fn try_acquire_lease(&self, id: &str, ttl: Duration) -> Result<LeaseGrant> {
        let mut inner = self.inner.lock().await;
        Ok(inner.leases.try_acquire(id, ttl, Instant::now()))
    }

    async fn renew_lease(&self, id: &str) -> Result<LeaseRenewal> {
        let mut inner = self.inner.lock().await;
        Ok(inner.leases.renew(id, Instant::now()))
    }

    async fn release_lease(&self, id: &str) -> Result<()> {
        self.inner.lock().await.leases.release(id);
        Ok(())
    }

    async fn read_last_version(&self) -> Result<u64> {
        Ok(self.inner.lock().await.state.last_version)
    }

    async fn read_last_published(&self) -> Result<Option<ClusterStateBundle>> {
        Ok(self.inner.lock().await.state.last_published.clone())
    }

    async fn write_last_published(&self, version: u64, bundle: &ClusterStateBundle) -> Result<()> {
        // Held across the write so concurrent publications persist in order
        let mut inner = Arc::clone(&self.inner).lock_owned().await;
        if version <= inner.state.last_version {
            return Err(ControllerError::Coordination(format!(
                "version {} does not exceed stored version {}",
                version, inner.state.last_version
            )));
        }
        let next = PersistedState {
            last_version: version,
            last_published: Some(bundle.clone()),
        };
        let path = self.path.clone();
        // The blocking task runs to completion even if the caller stops
        // waiting, so the file and the loaded state never disagree
        tokio::task::spawn_blocking(move || {
            write_atomically(&path, &next)?;
            inner.state = next;
            Ok::<_, ControllerError>(())
        })
        .await
        .map_err(|e| ControllerError::Coordination(format!("persist task failed: {}", e)))?
    }
}
