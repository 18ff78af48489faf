//! Weighted round-robin load balancing strategy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::Upstream;

/// Weighted round-robin selector.
///
/// A shared cursor walks the cumulative weights of the candidate list: with
/// weights `[1, 1, 2]` the cycle is `a, b, c, c`. The same candidates and
/// cursor always produce the same pick.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: AtomicU64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the rotation at a given cursor position.
    pub fn with_cursor(cursor: u64) -> Self {
        Self {
            cursor: AtomicU64::new(cursor),
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn next_server(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        let total: u64 = candidates.iter().map(|u| u64::from(u.weight())).sum();
        if total == 0 {
            return None;
        }

        let mut slot = self.cursor.fetch_add(1, Ordering::Relaxed) % total;
        for upstream in candidates {
            let weight = u64::from(upstream.weight());
            if slot < weight {
                return Some(upstream.clone());
            }
            slot -= weight;
        }
        None
    }
}
