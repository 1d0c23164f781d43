//! Transition governor.
//!
//! Sits between the generator and publication and applies hysteresis per
//! node and per cluster-level state:
//!
//! - a change toward less availability must persist for the stabilization
//!   window before it is published
//! - a change toward more availability is published once the node has sent
//!   enough consecutive available reports
//! - operator driven changes are published immediately
//! - a change that reverts before its deadline is never published
//!
//! Publications are also spaced by a minimum interval; changes arriving in
//! between coalesce into the next version.

use crate::config::TransitionPolicy;
use crate::registry::RegistrySnapshot;
use crate::state::{AnnotatedClusterState, ClusterStateBundle, Node, State, StateReason};
use std::collections::{BTreeMap, BTreeSet};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Scope {
    Baseline,
    Space(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Entry {
    Cluster,
    Node(Node),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    PendingDown { since: Instant, deadline: Instant },
    PendingUp { since: Instant },
}

/// Outcome of evaluating a candidate
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Nothing differs from the published bundle
    Unchanged,
    /// Differences exist but are still inside their stabilization window
    Pending,
    /// A committed change waits for the minimum publication interval
    Throttled,
    /// Publish this bundle under a new version
    Publish(ClusterStateBundle),
}

pub struct TransitionGovernor {
    policy: TransitionPolicy,
    published: Option<ClusterStateBundle>,
    last_publication: Option<Instant>,
    pending: BTreeMap<(Scope, Entry), Transition>,
}

impl TransitionGovernor {
    pub fn new(policy: TransitionPolicy) -> Self {
        Self {
            policy,
            published: None,
            last_publication: None,
            pending: BTreeMap::new(),
        }
    }

    pub fn published(&self) -> Option<&ClusterStateBundle> {
        self.published.as_ref()
    }

    /// Number of entries waiting for their window or confirmation
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest deadline of a pending down transition
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|t| match t {
                Transition::PendingDown { deadline, .. } => Some(*deadline),
                Transition::PendingUp { .. } => None,
            })
            .min()
    }

    pub fn evaluate(
        &mut self,
        candidate: &ClusterStateBundle,
        registry: &RegistrySnapshot,
        now: Instant,
    ) -> Verdict {
        let Some(published) = self.published.clone() else {
            return Verdict::Publish(candidate.clone());
        };

        let mut touched = BTreeSet::new();
        let baseline = self.govern_state(
            Scope::Baseline,
            &candidate.baseline,
            &published.baseline,
            registry,
            now,
            &mut touched,
        );

        let mut derived = BTreeMap::new();
        for (space, candidate_space) in &candidate.derived {
            let governed = match published.derived.get(space) {
                Some(published_space) => self.govern_state(
                    Scope::Space(space.clone()),
                    candidate_space,
                    published_space,
                    registry,
                    now,
                    &mut touched,
                ),
                None => candidate_space.clone(),
            };
            derived.insert(space.clone(), clamp_to_baseline(governed, &baseline));
        }

        self.pending.retain(|key, _| touched.contains(key));

        let governed = ClusterStateBundle::new(baseline, derived);
        if governed.similar_to(&published) {
            if self.pending.is_empty() {
                return Verdict::Unchanged;
            }
            return Verdict::Pending;
        }

        if let Some(last) = self.last_publication {
            if now < last + self.policy.min_publication_interval() {
                debug!("publication throttled by minimum interval");
                return Verdict::Throttled;
            }
        }
        Verdict::Publish(governed)
    }

    fn govern_state(
        &mut self,
        scope: Scope,
        candidate: &AnnotatedClusterState,
        published: &AnnotatedClusterState,
        registry: &RegistrySnapshot,
        now: Instant,
        touched: &mut BTreeSet<(Scope, Entry)>,
    ) -> AnnotatedClusterState {
        let mut governed = candidate.clone();

        let key = (scope.clone(), Entry::Cluster);
        touched.insert(key.clone());
        let cluster = match (published.state.cluster, candidate.state.cluster) {
            (from, to) if from == to => {
                self.pending.remove(&key);
                to
            }
            // Recovery of the cluster-level state is immediate
            (_, State::Up) => {
                self.pending.remove(&key);
                State::Up
            }
            (from, to) => {
                if self.window_elapsed(key, now) {
                    to
                } else {
                    from
                }
            }
        };
        if cluster != candidate.state.cluster {
            governed.state.cluster = cluster;
            governed.cluster_reason = published.cluster_reason.clone();
        }

        for (node, to) in candidate.state.nodes() {
            let Some(from) = published.state.get(node) else {
                continue;
            };
            let key = (scope.clone(), Entry::Node(node));
            touched.insert(key.clone());

            let value = if from == to {
                self.pending.remove(&key);
                to
            } else if to.is_more_restrictive_than(from) {
                if is_operator_driven(candidate.reason(node), to) {
                    self.pending.remove(&key);
                    to
                } else if self.window_elapsed(key, now) {
                    to
                } else {
                    from
                }
            } else {
                self.toward_available(key, scope == Scope::Baseline, node, registry, now, from, to)
            };

            if value != to {
                governed.state.set_node_state(node, value);
                match published.reason(node) {
                    Some(reason) => governed.reasons.insert(node, reason.clone()),
                    None => governed.reasons.remove(&node),
                };
            }
        }
        governed
    }

    /// Track a pending down transition; true once its window has elapsed
    fn window_elapsed(&mut self, key: (Scope, Entry), now: Instant) -> bool {
        let window = self.policy.stabilization_window();
        let transition = self.pending.entry(key).or_insert(Transition::PendingDown {
            since: now,
            deadline: now + window,
        });
        if let Transition::PendingUp { .. } = transition {
            *transition = Transition::PendingDown {
                since: now,
                deadline: now + window,
            };
        }
        match transition {
            Transition::PendingDown { deadline, .. } => now >= *deadline,
            Transition::PendingUp { .. } => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn toward_available(
        &mut self,
        key: (Scope, Entry),
        is_baseline: bool,
        node: Node,
        registry: &RegistrySnapshot,
        now: Instant,
        from: State,
        to: State,
    ) -> State {
        let confirmations = registry
            .get(node)
            .map(|r| r.consecutive_available_reports)
            .unwrap_or(0);
        let confirmed = !is_baseline
            || !matches!(to, State::Up | State::Initializing)
            || confirmations >= self.policy.up_confirmation_reports;
        if confirmed {
            self.pending.remove(&key);
            return to;
        }
        match self.pending.get(&key) {
            Some(Transition::PendingUp { .. }) => {}
            _ => {
                self.pending.insert(key, Transition::PendingUp { since: now });
            }
        }
        from
    }

    /// Record `bundle` as published at `now`
    pub fn accept(&mut self, bundle: &ClusterStateBundle, now: Instant) {
        self.published = Some(bundle.clone());
        self.last_publication = Some(now);
        self.pending.retain(|_, transition| match transition {
            Transition::PendingDown { deadline, .. } => *deadline > now,
            Transition::PendingUp { .. } => true,
        });
    }

    /// Seed the governor with a bundle published by another instance and
    /// drop every pending timer
    pub fn reset(&mut self, bundle: Option<ClusterStateBundle>) {
        self.published = bundle;
        self.last_publication = None;
        self.pending.clear();
    }

    /// How long each pending entry has been waiting, for status output
    pub fn pending_since(&self, now: Instant) -> Vec<(String, std::time::Duration)> {
        self.pending
            .iter()
            .map(|((scope, entry), transition)| {
                let since = match transition {
                    Transition::PendingDown { since, .. } | Transition::PendingUp { since } => {
                        *since
                    }
                };
                let scope = match scope {
                    Scope::Baseline => "baseline".to_string(),
                    Scope::Space(space) => space.clone(),
                };
                let entry = match entry {
                    Entry::Cluster => "cluster".to_string(),
                    Entry::Node(node) => node.to_string(),
                };
                (format!("{}/{}", scope, entry), now.saturating_duration_since(since))
            })
            .collect()
    }
}

/// Changes that do not come from health observations
fn is_operator_driven(reason: Option<&StateReason>, to: State) -> bool {
    to == State::Retired
        || matches!(
            reason,
            Some(StateReason::WantedState(_) | StateReason::RetiredDrained)
        )
}

/// Derived states may never be more available than the governed baseline
fn clamp_to_baseline(
    mut derived: AnnotatedClusterState,
    baseline: &AnnotatedClusterState,
) -> AnnotatedClusterState {
    if !baseline.state.is_cluster_up() && derived.state.is_cluster_up() {
        derived.state.cluster = baseline.state.cluster;
        derived.cluster_reason = baseline.cluster_reason.clone();
    }
    let nodes: Vec<(Node, State)> = derived.state.nodes().collect();
    for (node, state) in nodes {
        let base = baseline.state.node_state(node);
        let clamp = if node.kind.is_bucket_space_independent() {
            state != base
        } else {
            base.is_more_restrictive_than(state)
        };
        if clamp {
            derived.state.set_node_state(node, base);
            match baseline.reason(node) {
                Some(reason) => derived.reasons.insert(node, reason.clone()),
                None => derived.reasons.remove(&node),
            };
        }
    }
    derived
}
