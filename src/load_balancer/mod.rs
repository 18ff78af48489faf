//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request needs an upstream (exclusion set from earlier attempts)
//!     → pool.rs (snapshot registry, keep Healthy and not excluded)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (weighted rotation)
//!         - least_conn.rs (fewest in-flight requests)
//!     → reserve an in-flight slot on the chosen upstream
//!     → Return upstream guard or SelectError
//! ```
//!
//! # Design Decisions
//! - Algorithms only see eligible candidates; eligibility lives in pool.rs
//! - Retry-without-repeat is an explicit exclusion set, not balancer state
//! - Deterministic for a fixed candidate list and cursor

pub mod least_conn;
pub mod pool;
pub mod round_robin;

use std::sync::Arc;

use thiserror::Error;

use crate::config::Algorithm;
use crate::registry::Upstream;

pub use least_conn::LeastConnections;
pub use pool::Balancer;
pub use round_robin::WeightedRoundRobin;

/// A strategy picking one upstream out of an eligible candidate list.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick the next upstream, or `None` if `candidates` is empty.
    fn next_server(&self, candidates: &[Arc<Upstream>]) -> Option<Arc<Upstream>>;
}

/// Why no upstream could be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no healthy upstream available")]
    NoHealthyUpstream,

    #[error("every eligible upstream is at its connection limit")]
    AtCapacity,
}

/// Build the strategy for a configured algorithm.
pub fn strategy(algorithm: Algorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
    }
}
