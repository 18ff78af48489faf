//! Upstream health state machine.
//!
//! # States
//! - Healthy: upstream receives new requests
//! - Unhealthy: upstream excluded from load balancing
//! - Draining: administratively excluded; in-flight requests finish
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Slow failure, fast recovery (3 failures / 1 success by default)
//! - Draining is orthogonal to probe results: probes keep running while an
//!   upstream drains, so undraining restores the last observed health
//! - Counters are owned by a single writer per upstream

use std::fmt;

use serde::Serialize;

use crate::config::HealthCheckConfig;

/// Eligibility of an upstream for new requests.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy = 1,
    Unhealthy = 2,
    Draining = 3,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Draining => "draining",
        }
    }
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            3 => HealthState::Draining,
            _ => HealthState::Unhealthy,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure,
}

/// Thresholds governing health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

impl From<&HealthCheckConfig> for HealthPolicy {
    fn from(config: &HealthCheckConfig) -> Self {
        Self {
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            healthy_threshold: config.healthy_threshold.max(1),
        }
    }
}

/// A health change produced by a probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Probe history for one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTracker {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Upstreams start healthy so traffic flows before the first probe lands.
    pub fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Fold one probe outcome in, returning the transition if health changed.
    pub fn record(&mut self, outcome: ProbeOutcome, policy: HealthPolicy) -> Option<Transition> {
        match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                if !self.healthy && self.consecutive_successes >= policy.healthy_threshold {
                    self.healthy = true;
                    return Some(Transition {
                        from: HealthState::Unhealthy,
                        to: HealthState::Healthy,
                    });
                }
            }
            ProbeOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.healthy && self.consecutive_failures >= policy.unhealthy_threshold {
                    self.healthy = false;
                    return Some(Transition {
                        from: HealthState::Healthy,
                        to: HealthState::Unhealthy,
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_slowly() {
        let policy = HealthPolicy::default();
        let mut tracker = HealthTracker::new();

        assert_eq!(tracker.record(ProbeOutcome::Failure, policy), None);
        assert_eq!(tracker.record(ProbeOutcome::Failure, policy), None);
        assert!(tracker.is_healthy());

        let transition = tracker.record(ProbeOutcome::Failure, policy);
        assert_eq!(
            transition,
            Some(Transition {
                from: HealthState::Healthy,
                to: HealthState::Unhealthy
            })
        );
        assert!(!tracker.is_healthy());

        // Further failures do not re-announce the transition.
        assert_eq!(tracker.record(ProbeOutcome::Failure, policy), None);
        assert_eq!(tracker.consecutive_failures(), 4);
    }

    #[test]
    fn recovers_fast() {
        let policy = HealthPolicy::default();
        let mut tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record(ProbeOutcome::Failure, policy);
        }
        let transition = tracker.record(ProbeOutcome::Success, policy);
        assert_eq!(transition.map(|t| t.to), Some(HealthState::Healthy));
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_failure_streak() {
        let policy = HealthPolicy::default();
        let mut tracker = HealthTracker::new();
        tracker.record(ProbeOutcome::Failure, policy);
        tracker.record(ProbeOutcome::Failure, policy);
        tracker.record(ProbeOutcome::Success, policy);
        tracker.record(ProbeOutcome::Failure, policy);
        tracker.record(ProbeOutcome::Failure, policy);
        assert!(tracker.is_healthy());
    }

    #[test]
    fn honours_recovery_threshold() {
        let policy = HealthPolicy {
            unhealthy_threshold: 1,
            healthy_threshold: 2,
        };
        let mut tracker = HealthTracker::new();
        tracker.record(ProbeOutcome::Failure, policy);
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.record(ProbeOutcome::Success, policy), None);
        assert!(tracker.record(ProbeOutcome::Success, policy).is_some());
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [HealthState::Healthy, HealthState::Unhealthy, HealthState::Draining] {
            assert_eq!(HealthState::from(state as u8), state);
        }
    }
}
