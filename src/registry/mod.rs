//! Upstream registry.
//!
//! # Data Flow
//! ```text
//! Config (upstreams) → Registry::new → Snapshot (immutable, Arc-shared)
//!
//! Readers (load balancer, admin, prober):
//!     list() → Arc<Snapshot>   (lock-free, consistent)
//!
//! Writers:
//!     mark(id, outcome)     → per-upstream tracker lock only
//!     set_draining(id, ..)  → per-upstream atomic
//!     replace(configs)      → new Snapshot swapped in atomically
//! ```
//!
//! # Design Decisions
//! - The upstream set is immutable per snapshot; reload swaps the whole set
//! - Health lives on each upstream, so writers never contend with each other
//!   or with readers
//! - Identifiers that survive a reload keep their health history

pub mod upstream;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{ProxyConfig, UpstreamConfig};
use crate::health::state::{HealthPolicy, HealthState, ProbeOutcome, Transition};

pub use upstream::{Upstream, UpstreamGuard, UpstreamStatus};

/// Error type for registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown upstream `{0}`")]
    UnknownUpstream(String),

    #[error("duplicate upstream `{0}`")]
    DuplicateUpstream(String),

    #[error("upstream set is empty")]
    Empty,
}

/// An immutable view of the upstream set.
#[derive(Debug, Default)]
pub struct Snapshot {
    upstreams: Vec<Arc<Upstream>>,
    index: HashMap<String, usize>,
    generation: u64,
}

impl Snapshot {
    fn build(upstreams: Vec<Arc<Upstream>>, generation: u64) -> Result<Self, RegistryError> {
        if upstreams.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut index = HashMap::with_capacity(upstreams.len());
        for (i, upstream) in upstreams.iter().enumerate() {
            if index.insert(upstream.id().to_string(), i).is_some() {
                return Err(RegistryError::DuplicateUpstream(upstream.id().to_string()));
            }
        }
        Ok(Self {
            upstreams,
            index,
            generation,
        })
    }

    /// Upstreams in configuration order.
    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.index.get(id).map(|&i| &self.upstreams[i])
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Incremented on every reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter()
    }
}

/// The set of known upstreams and their health.
pub struct Registry {
    snapshot: ArcSwap<Snapshot>,
    policy: HealthPolicy,
    /// Serializes reloads; never taken on the request path.
    reload_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("upstreams", &self.snapshot.load().len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Registry {
    /// Create a registry from upstream configs.
    pub fn new(configs: &[UpstreamConfig], policy: HealthPolicy) -> Result<Self, RegistryError> {
        let upstreams = configs
            .iter()
            .map(|c| Arc::new(Upstream::from_config(c)))
            .collect();
        let snapshot = Snapshot::build(upstreams, 0)?;
        let (changes, _) = watch::channel(0);
        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            policy,
            reload_lock: Mutex::new(()),
            changes,
        })
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, RegistryError> {
        Self::new(&config.upstreams, HealthPolicy::from(&config.health_check))
    }

    /// A consistent snapshot of every upstream.
    pub fn list(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Upstream>> {
        self.snapshot.load().get(id).cloned()
    }

    pub fn policy(&self) -> HealthPolicy {
        self.policy
    }

    /// Record a probe outcome for one upstream.
    pub fn mark(&self, id: &str, outcome: ProbeOutcome) -> Result<Option<Transition>, RegistryError> {
        let upstream = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownUpstream(id.to_string()))?;
        let transition = upstream.record_probe(outcome, self.policy);
        if let Some(t) = transition {
            match t.to {
                HealthState::Unhealthy => tracing::warn!(
                    upstream = %id,
                    failures = upstream.consecutive_failures(),
                    "Upstream marked unhealthy"
                ),
                _ => tracing::info!(upstream = %id, from = %t.from, to = %t.to, "Upstream recovered"),
            }
        }
        Ok(transition)
    }

    /// Set or clear the administrative Draining state. Returns true if it changed.
    pub fn set_draining(&self, id: &str, draining: bool) -> Result<bool, RegistryError> {
        let upstream = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownUpstream(id.to_string()))?;
        let changed = upstream.set_draining(draining);
        if changed {
            tracing::info!(upstream = %id, draining, "Upstream drain state changed");
        }
        Ok(changed)
    }

    /// Atomically replace the upstream set.
    ///
    /// Upstreams whose identifier survives keep their health, drain state and
    /// in-flight count, even when their weight or cap changes.
    /// Requests already holding a removed upstream finish against it.
    pub fn replace(&self, configs: &[UpstreamConfig]) -> Result<(), RegistryError> {
        let _reload = self
            .reload_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.snapshot.load_full();

        let upstreams = configs
            .iter()
            .map(|config| match current.get(&config.address) {
                Some(existing)
                    if existing.weight() == config.weight
                        && existing.max_connections() == config.max_connections =>
                {
                    existing.clone()
                }
                Some(existing) => Arc::new(Upstream::succeed(existing, config)),
                None => Arc::new(Upstream::from_config(config)),
            })
            .collect();

        let generation = current.generation() + 1;
        let next = Snapshot::build(upstreams, generation)?;
        tracing::info!(
            generation,
            upstreams = next.len(),
            "Upstream set replaced"
        );
        self.snapshot.store(Arc::new(next));
        self.changes.send_replace(generation);
        Ok(())
    }

    /// Notified with the new generation after every `replace`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(addrs: &[&str]) -> Registry {
        let configs: Vec<_> = addrs.iter().map(|a| UpstreamConfig::new(*a)).collect();
        Registry::new(&configs, HealthPolicy::default()).unwrap()
    }

    #[test]
    fn list_preserves_config_order() {
        let registry = registry(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let ids: Vec<_> = registry.list().iter().map(|u| u.id().to_string()).collect();
        assert_eq!(ids, ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
    }

    #[test]
    fn rejects_duplicates_and_empty_sets() {
        let dup = [UpstreamConfig::new("10.0.0.1:80"), UpstreamConfig::new("10.0.0.1:80")];
        assert_eq!(
            Registry::new(&dup, HealthPolicy::default()).unwrap_err(),
            RegistryError::DuplicateUpstream("10.0.0.1:80".into())
        );
        assert_eq!(
            Registry::new(&[], HealthPolicy::default()).unwrap_err(),
            RegistryError::Empty
        );
    }

    #[test]
    fn threshold_failures_mark_unhealthy() {
        let registry = registry(&["10.0.0.1:80"]);
        assert_eq!(registry.mark("10.0.0.1:80", ProbeOutcome::Failure), Ok(None));
        assert_eq!(registry.mark("10.0.0.1:80", ProbeOutcome::Failure), Ok(None));
        let t = registry.mark("10.0.0.1:80", ProbeOutcome::Failure).unwrap();
        assert_eq!(t.map(|t| t.to), Some(HealthState::Unhealthy));
        assert_eq!(registry.get("10.0.0.1:80").unwrap().state(), HealthState::Unhealthy);

        let t = registry.mark("10.0.0.1:80", ProbeOutcome::Success).unwrap();
        assert_eq!(t.map(|t| t.to), Some(HealthState::Healthy));
    }

    #[test]
    fn unknown_ids_are_errors() {
        let registry = registry(&["10.0.0.1:80"]);
        assert_eq!(
            registry.mark("10.0.0.9:80", ProbeOutcome::Success),
            Err(RegistryError::UnknownUpstream("10.0.0.9:80".into()))
        );
        assert!(registry.set_draining("10.0.0.9:80", true).is_err());
    }

    #[test]
    fn replace_keeps_surviving_state() {
        let registry = registry(&["10.0.0.1:80", "10.0.0.2:80"]);
        registry.set_draining("10.0.0.1:80", true).unwrap();
        for _ in 0..3 {
            registry.mark("10.0.0.2:80", ProbeOutcome::Failure).unwrap();
        }
        let mut changes = registry.subscribe();

        registry
            .replace(&[
                UpstreamConfig::new("10.0.0.1:80"),
                UpstreamConfig::new("10.0.0.2:80").with_weight(4),
                UpstreamConfig::new("10.0.0.3:80"),
            ])
            .unwrap();

        let snapshot = registry.list();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("10.0.0.1:80").unwrap().state(), HealthState::Draining);
        let second = snapshot.get("10.0.0.2:80").unwrap();
        assert_eq!(second.weight(), 4);
        assert_eq!(second.state(), HealthState::Unhealthy);
        assert_eq!(snapshot.get("10.0.0.3:80").unwrap().state(), HealthState::Healthy);
        assert!(changes.has_changed().unwrap());
    }

    #[test]
    fn reweighted_upstream_keeps_in_flight_count_and_cap() {
        let registry = Registry::new(
            &[UpstreamConfig::new("10.0.0.1:80").with_max_connections(1)],
            HealthPolicy::default(),
        )
        .unwrap();
        let held = registry.get("10.0.0.1:80").unwrap().try_acquire().unwrap();

        registry
            .replace(&[UpstreamConfig::new("10.0.0.1:80").with_weight(2).with_max_connections(1)])
            .unwrap();

        let current = registry.get("10.0.0.1:80").unwrap();
        assert_eq!(current.weight(), 2);
        assert_eq!(current.active_connections(), 1);
        assert!(current.try_acquire().is_none());

        // A health result recorded against the retired entry still lands.
        let policy = HealthPolicy {
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        };
        held.upstream().record_probe(ProbeOutcome::Failure, policy);
        assert_eq!(current.state(), HealthState::Unhealthy);

        drop(held);
        assert_eq!(current.active_connections(), 0);
    }

    #[test]
    fn failed_replace_leaves_set_untouched() {
        let registry = registry(&["10.0.0.1:80"]);
        assert_eq!(registry.replace(&[]), Err(RegistryError::Empty));
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.list().generation(), 0);
    }

    #[test]
    fn old_snapshot_stays_consistent_after_replace() {
        let registry = registry(&["10.0.0.1:80", "10.0.0.2:80"]);
        let before = registry.list();
        registry.replace(&[UpstreamConfig::new("10.0.0.3:80")]).unwrap();
        assert_eq!(before.len(), 2);
        assert!(before.get("10.0.0.3:80").is_none());
        assert_eq!(registry.list().len(), 1);
    }
}
