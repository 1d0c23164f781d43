//! Leader coordinator for one controller instance.

use super::{CoordinationStore, LeaseGrant, LeaseRenewal};
use crate::config::CoordinationConfig;
use crate::error::{ControllerError, Result};
use crate::state::ClusterStateBundle;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What a newly elected leader learned from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    pub last_version: u64,
    pub last_bundle: Option<ClusterStateBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderTerm {
    /// Increases with every acquisition by this instance
    pub term: u64,
    pub acquired_at: Instant,
    pub takeover: Takeover,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Leadership {
    #[default]
    Standby,
    Leader(LeaderTerm),
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }
}

#[derive(Debug, Default)]
struct LeaseState {
    term: u64,
    /// End of the lease as seen locally, measured from the start of the
    /// request that granted or renewed it
    valid_until: Option<Instant>,
    last_published: u64,
}

pub struct LeaderCoordinator {
    id: String,
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    state: Mutex<LeaseState>,
    leadership: watch::Sender<Leadership>,
}

impl LeaderCoordinator {
    pub fn new<S: Into<String>>(
        id: S,
        store: Arc<dyn CoordinationStore>,
        config: CoordinationConfig,
    ) -> Self {
        let (leadership, _) = watch::channel(Leadership::Standby);
        Self {
            id: id.into(),
            store,
            config,
            state: Mutex::new(LeaseState::default()),
            leadership,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.leadership.subscribe()
    }

    pub fn leadership(&self) -> Leadership {
        self.leadership.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.borrow().is_leader()
    }

    fn lease_state(&self) -> std::sync::MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout(), future).await {
            Ok(result) => result,
            Err(_) => Err(ControllerError::Timeout(format!(
                "coordination store {} after {:?}",
                operation,
                self.config.store_timeout()
            ))),
        }
    }

    /// Try to become leader. Returns the takeover information when the
    /// lease was granted, `None` when it is held elsewhere or already ours.
    pub async fn try_acquire(&self) -> Result<Option<Takeover>> {
        if self.is_leader() {
            return Ok(None);
        }
        let started = Instant::now();
        let ttl = self.config.lease_ttl();
        match self
            .call("acquire", self.store.try_acquire_lease(&self.id, ttl))
            .await?
        {
            LeaseGrant::Denied { holder } => {
                debug!(id = %self.id, %holder, "lease held by another controller");
                return Ok(None);
            }
            LeaseGrant::Granted => {}
        }

        let loaded = async {
            let last_version = self
                .call("read version", self.store.read_last_version())
                .await?;
            let last_bundle = self
                .call("read bundle", self.store.read_last_published())
                .await?;
            Ok::<_, ControllerError>(Takeover {
                last_version,
                last_bundle,
            })
        }
        .await;
        let takeover = match loaded {
            Ok(takeover) => takeover,
            Err(e) => {
                // Without the last version we cannot number publications
                if let Err(release) = self
                    .call("release", self.store.release_lease(&self.id))
                    .await
                {
                    warn!(id = %self.id, error = %release, "lease release after failed takeover load failed");
                }
                return Err(e);
            }
        };

        let term = {
            let mut state = self.lease_state();
            state.term += 1;
            state.valid_until = Some(started + ttl);
            state.last_published = state.last_published.max(takeover.last_version);
            state.term
        };
        info!(
            id = %self.id,
            term,
            last_version = takeover.last_version,
            "acquired leadership"
        );
        self.leadership.send_replace(Leadership::Leader(LeaderTerm {
            term,
            acquired_at: started,
            takeover: takeover.clone(),
        }));
        Ok(Some(takeover))
    }

    /// Renew the lease. Any failure means leadership is lost.
    pub async fn renew(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(ControllerError::NotLeader);
        }
        let started = Instant::now();
        let reason = match self
            .call("renew", self.store.renew_lease(&self.id))
            .await
        {
            Ok(LeaseRenewal::Renewed) => {
                self.lease_state().valid_until = Some(started + self.config.lease_ttl());
                return Ok(());
            }
            Ok(LeaseRenewal::Lost) => "lease expired or taken over".to_string(),
            Err(e) => e.to_string(),
        };
        self.step_down(&reason);
        Err(ControllerError::LeaseLost(reason))
    }

    pub async fn release(&self) -> Result<()> {
        if !self.is_leader() {
            return Ok(());
        }
        self.step_down("released");
        self.call("release", self.store.release_lease(&self.id))
            .await
    }

    fn step_down(&self, reason: &str) {
        self.lease_state().valid_until = None;
        if self.leadership.borrow().is_leader() {
            warn!(id = %self.id, reason, "stepped down from leadership");
            self.leadership.send_replace(Leadership::Standby);
        }
    }

    /// Whether a publication started at `now` is covered by the lease
    pub fn can_publish(&self, now: Instant) -> bool {
        self.is_leader()
            && self
                .lease_state()
                .valid_until
                .is_some_and(|until| now < until)
    }

    /// Version for the next publication
    pub fn next_version(&self) -> u64 {
        self.lease_state().last_published + 1
    }

    pub fn last_published_version(&self) -> u64 {
        self.lease_state().last_published
    }

    /// Persist a publication before it is broadcast. A failed write steps
    /// down: the store may already hold a newer version.
    pub async fn record_publication(&self, bundle: &ClusterStateBundle) -> Result<()> {
        if !self.can_publish(Instant::now()) {
            return Err(ControllerError::NotLeader);
        }
        match self
            .call(
                "write",
                self.store.write_last_published(bundle.version, bundle),
            )
            .await
        {
            Ok(()) => {
                let mut state = self.lease_state();
                state.last_published = state.last_published.max(bundle.version);
                Ok(())
            }
            Err(e) => {
                let reason = format!("persisting version {} failed: {}", bundle.version, e);
                self.step_down(&reason);
                Err(ControllerError::LeaseLost(reason))
            }
        }
    }

    /// Renew while leader, retry acquisition while standby, until
    /// `shutdown` turns true. The lease is released on exit.
    pub async fn run_lease_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.is_leader() {
                let expired = self
                    .lease_state()
                    .valid_until
                    .map_or(true, |until| Instant::now() >= until);
                if expired {
                    self.step_down("lease expired before renewal");
                } else if let Err(e) = self.renew().await {
                    warn!(id = %self.id, error = %e, "lease renewal failed");
                }
            } else if let Err(e) = self.try_acquire().await {
                warn!(id = %self.id, error = %e, "lease acquisition failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.renew_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.release().await {
            warn!(id = %self.id, error = %e, "lease release failed");
        }
    }
}
