//! Upstream selection over the registry.
//!
//! # Responsibilities
//! - Filter the registry snapshot down to eligible upstreams
//! - Apply the configured load balancing algorithm
//! - Hand out guards that track in-flight requests

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::Algorithm;
use crate::load_balancer::{strategy, LoadBalancer, SelectError};
use crate::registry::{Registry, Upstream, UpstreamGuard};

/// Picks upstreams for requests.
#[derive(Debug)]
pub struct Balancer {
    registry: Arc<Registry>,
    strategy: Box<dyn LoadBalancer>,
}

impl Balancer {
    pub fn new(registry: Arc<Registry>, algorithm: Algorithm) -> Self {
        Self::with_strategy(registry, strategy(algorithm))
    }

    pub fn with_strategy(registry: Arc<Registry>, strategy: Box<dyn LoadBalancer>) -> Self {
        Self { registry, strategy }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Select an upstream that is Healthy, not Draining and not in `excluding`.
    ///
    /// Upstreams at their connection cap are skipped; if that leaves nothing,
    /// the error is `AtCapacity` rather than `NoHealthyUpstream`.
    pub fn select(&self, excluding: &HashSet<String>) -> Result<UpstreamGuard, SelectError> {
        let snapshot = self.registry.list();
        let mut candidates: Vec<Arc<Upstream>> = snapshot
            .iter()
            .filter(|u| u.is_selectable() && !excluding.contains(u.id()))
            .cloned()
            .collect();

        if candidates.is_empty() {
            tracing::debug!(
                upstreams = snapshot.len(),
                excluded = excluding.len(),
                "No healthy upstreams found"
            );
            return Err(SelectError::NoHealthyUpstream);
        }

        while let Some(upstream) = self.strategy.next_server(&candidates) {
            if let Some(guard) = upstream.try_acquire() {
                return Ok(guard);
            }
            tracing::debug!(
                upstream = %upstream.id(),
                max_connections = upstream.max_connections(),
                "Upstream at connection limit"
            );
            candidates.retain(|c| !Arc::ptr_eq(c, &upstream));
        }
        Err(SelectError::AtCapacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::health::state::{HealthPolicy, HealthState, ProbeOutcome};
    use crate::load_balancer::WeightedRoundRobin;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn balancer(configs: &[UpstreamConfig]) -> Balancer {
        let registry = Arc::new(Registry::new(configs, HealthPolicy::default()).unwrap());
        Balancer::with_strategy(registry, Box::new(WeightedRoundRobin::new()))
    }

    fn none() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn weighted_distribution() {
        let lb = balancer(&[
            UpstreamConfig::new("10.0.0.1:80"),
            UpstreamConfig::new("10.0.0.2:80"),
            UpstreamConfig::new("10.0.0.3:80").with_weight(2),
        ]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..400 {
            let guard = lb.select(&none()).unwrap();
            *counts.entry(guard.id().to_string()).or_default() += 1;
        }

        let share = |id: &str| counts[id] as f64 / 400.0;
        assert!((share("10.0.0.1:80") - 0.25).abs() < 0.02, "{counts:?}");
        assert!((share("10.0.0.2:80") - 0.25).abs() < 0.02, "{counts:?}");
        assert!((share("10.0.0.3:80") - 0.50).abs() < 0.02, "{counts:?}");
    }

    #[test]
    fn never_selects_unhealthy_or_draining() {
        let lb = balancer(&[
            UpstreamConfig::new("10.0.0.1:80"),
            UpstreamConfig::new("10.0.0.2:80"),
            UpstreamConfig::new("10.0.0.3:80"),
        ]);
        let registry = lb.registry().clone();
        for _ in 0..3 {
            registry.mark("10.0.0.1:80", ProbeOutcome::Failure).unwrap();
        }
        registry.set_draining("10.0.0.2:80", true).unwrap();

        for _ in 0..50 {
            assert_eq!(lb.select(&none()).unwrap().id(), "10.0.0.3:80");
        }

        registry.set_draining("10.0.0.3:80", true).unwrap();
        assert_eq!(lb.select(&none()).unwrap_err(), SelectError::NoHealthyUpstream);

        // One good probe brings the first upstream back.
        registry.mark("10.0.0.1:80", ProbeOutcome::Success).unwrap();
        assert_eq!(lb.select(&none()).unwrap().id(), "10.0.0.1:80");
    }

    #[test]
    fn exclusions_skip_upstreams() {
        let lb = balancer(&[UpstreamConfig::new("10.0.0.1:80"), UpstreamConfig::new("10.0.0.2:80")]);
        let mut excluded = HashSet::new();
        excluded.insert("10.0.0.1:80".to_string());
        for _ in 0..10 {
            assert_eq!(lb.select(&excluded).unwrap().id(), "10.0.0.2:80");
        }
        excluded.insert("10.0.0.2:80".to_string());
        assert_eq!(lb.select(&excluded).unwrap_err(), SelectError::NoHealthyUpstream);
    }

    #[test]
    fn saturated_upstreams_are_skipped() {
        let lb = balancer(&[
            UpstreamConfig::new("10.0.0.1:80").with_max_connections(1),
            UpstreamConfig::new("10.0.0.2:80").with_max_connections(1),
        ]);
        let first = lb.select(&none()).unwrap();
        let second = lb.select(&none()).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(lb.select(&none()).unwrap_err(), SelectError::AtCapacity);

        drop(first);
        assert!(lb.select(&none()).is_ok());
    }

    #[test]
    fn concurrent_probes_and_selects() {
        let configs: Vec<_> = (0..8)
            .map(|i| UpstreamConfig::new(format!("10.0.0.{}:80", i + 1)))
            .collect();
        let lb = Arc::new(balancer(&configs));
        let registry = lb.registry().clone();
        let stop = Arc::new(AtomicBool::new(false));

        // One writer per upstream, flapping its health.
        let writers: Vec<_> = configs
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let registry = registry.clone();
                let stop = stop.clone();
                let id = config.address.clone();
                thread::spawn(move || {
                    let mut n = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let outcome = if (n + i as u64) % 5 < 3 {
                            ProbeOutcome::Failure
                        } else {
                            ProbeOutcome::Success
                        };
                        registry.mark(&id, outcome).unwrap();
                        n += 1;
                    }
                    n
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lb = lb.clone();
                thread::spawn(move || {
                    let mut selected = 0;
                    for _ in 0..20_000 {
                        match lb.select(&HashSet::new()) {
                            Ok(guard) => {
                                assert!(guard.max_connections() > 0);
                                selected += 1;
                            }
                            Err(e) => assert_eq!(e, SelectError::NoHealthyUpstream),
                        }
                    }
                    selected
                })
            })
            .collect();

        let mut total_selected = 0;
        for reader in readers {
            total_selected += reader.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for writer in writers {
            assert!(writer.join().unwrap() > 0);
        }
        assert!(total_selected > 0);

        // Every guard was released and no state was torn.
        for upstream in registry.list().iter() {
            assert_eq!(upstream.active_connections(), 0);
            assert!(matches!(
                upstream.state(),
                HealthState::Healthy | HealthState::Unhealthy
            ));
        }
    }
}
