//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     One periodic task per upstream
//!     → GET <health path> with a short timeout
//!     → Registry::mark(id, outcome)
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy (thresholds prevent flapping)
//!     Draining set by the admin API, independent of probes
//! ```
//!
//! # Design Decisions
//! - Probe results only influence future selection, never in-flight requests
//! - A stuck probe stalls only its own upstream's task
//! - Health state is per-upstream

pub mod active;
pub mod state;

pub use active::{HealthMonitor, Prober};
pub use state::{HealthPolicy, HealthState, ProbeOutcome, Transition};
