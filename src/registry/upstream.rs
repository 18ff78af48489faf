//! Upstream abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track in-flight requests (for Least Connections and connection caps)
//! - Expose health state to lock-free readers
//! - Serialize health writers per upstream

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::UpstreamConfig;
use crate::health::state::{HealthPolicy, HealthState, HealthTracker, ProbeOutcome, Transition};

/// A single upstream server.
#[derive(Debug)]
pub struct Upstream {
    /// Identifier and address, `host:port`.
    id: String,
    /// Share of traffic under weighted round-robin.
    weight: u32,
    /// Maximum concurrent in-flight requests allowed.
    max_connections: usize,
    /// Shared with every successor built by a reload.
    shared: Arc<UpstreamState>,
}

/// Runtime state that outlives a single configuration of an upstream.
#[derive(Debug)]
struct UpstreamState {
    /// Number of in-flight requests.
    active_connections: AtomicUsize,
    /// Probe-driven health (Healthy or Unhealthy), mirrored from `tracker`.
    health: AtomicU8,
    /// Administrative drain flag.
    draining: AtomicBool,
    /// Mirrored from `tracker` for readers.
    consecutive_failures: AtomicU32,
    /// Milliseconds since the Unix epoch; 0 until the first probe.
    last_probe_ms: AtomicU64,
    /// Writer side of the health state. Held only while folding in a probe.
    tracker: Mutex<HealthTracker>,
}

impl UpstreamState {
    fn new() -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            health: AtomicU8::new(HealthState::Healthy as u8),
            draining: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_probe_ms: AtomicU64::new(0),
            tracker: Mutex::new(HealthTracker::new()),
        }
    }
}

impl Upstream {
    /// Create a new upstream. Health starts out Healthy.
    pub fn new(id: impl Into<String>, weight: u32, max_connections: usize) -> Self {
        Self {
            id: id.into(),
            weight: weight.max(1),
            max_connections,
            shared: Arc::new(UpstreamState::new()),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(config.address.clone(), config.weight, config.max_connections)
    }

    /// Build a replacement for `previous` with new weight and cap.
    ///
    /// The successor shares the in-flight count and health state of `previous`,
    /// so guards and health writers still holding the old entry stay visible.
    pub(crate) fn succeed(previous: &Upstream, config: &UpstreamConfig) -> Self {
        Self {
            id: config.address.clone(),
            weight: config.weight.max(1),
            max_connections: config.max_connections,
            shared: Arc::clone(&previous.shared),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Get the current number of in-flight requests.
    pub fn active_connections(&self) -> usize {
        self.shared.active_connections.load(Ordering::Relaxed)
    }

    /// Effective state: Draining overrides probe-driven health.
    pub fn state(&self) -> HealthState {
        if self.is_draining() {
            HealthState::Draining
        } else {
            HealthState::from(self.shared.health.load(Ordering::Acquire))
        }
    }

    /// True when the upstream may receive new requests.
    pub fn is_selectable(&self) -> bool {
        self.state() == HealthState::Healthy
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Time of the last completed probe, if any.
    pub fn last_probe(&self) -> Option<SystemTime> {
        match self.shared.last_probe_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    /// Fold a probe outcome into this upstream's health.
    ///
    /// Only this upstream's writer lock is taken; readers never block.
    pub(crate) fn record_probe(&self, outcome: ProbeOutcome, policy: HealthPolicy) -> Option<Transition> {
        let mut tracker = self.lock_tracker();
        let transition = tracker.record(outcome, policy);
        let health = if tracker.is_healthy() {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };
        self.shared.consecutive_failures
            .store(tracker.consecutive_failures(), Ordering::Relaxed);
        self.shared.health.store(health as u8, Ordering::Release);
        self.shared.last_probe_ms.store(now_unix_ms(), Ordering::Relaxed);
        transition
    }

    /// Set the drain flag. Returns true if it changed.
    pub(crate) fn set_draining(&self, draining: bool) -> bool {
        self.shared.draining.swap(draining, Ordering::AcqRel) != draining
    }

    /// Try to reserve an in-flight slot. Returns `None` at the connection cap.
    pub fn try_acquire(self: &Arc<Self>) -> Option<UpstreamGuard> {
        let mut prev = self.shared.active_connections.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.shared.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(UpstreamGuard {
            upstream: self.clone(),
        })
    }

    /// Point-in-time view for the admin API.
    pub fn status(&self) -> UpstreamStatus {
        UpstreamStatus {
            id: self.id.clone(),
            weight: self.weight,
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            active_connections: self.active_connections(),
            max_connections: self.max_connections,
            last_probe_unix_ms: match self.shared.last_probe_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => Some(ms),
            },
        }
    }

    fn lock_tracker(&self) -> MutexGuard<'_, HealthTracker> {
        self.shared.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
        .max(1)
}

/// Serializable snapshot of one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub id: String,
    pub weight: u32,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub max_connections: usize,
    pub last_probe_unix_ms: Option<u64>,
}

/// A RAII guard that holds one in-flight slot on an upstream.
#[derive(Debug)]
pub struct UpstreamGuard {
    upstream: Arc<Upstream>,
}

impl UpstreamGuard {
    pub fn upstream(&self) -> &Arc<Upstream> {
        &self.upstream
    }
}

impl Deref for UpstreamGuard {
    type Target = Upstream;
    fn deref(&self) -> &Self::Target {
        &self.upstream
    }
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        self.upstream.shared.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
