//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::Upstream;

/// Least connections selector.
/// Selects the upstream with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>> {
        // min_by_key keeps the first minimum, so ties go to registry order
        candidates
            .iter()
            .min_by_key(|u| u.active_connections())
            .cloned()
    }
}
