//! Metrics collection and exposition.
//!
//! # Metrics
//! - `router_requests_total` (counter): requests by method, status, upstream
//! - `router_request_duration_seconds` (histogram): end-to-end latency to headers
//! - `router_upstream_attempts_total` (counter): attempts by upstream, outcome
//! - `router_upstream_healthy` (gauge): 1=selectable, 0=otherwise
//! - `router_active_connections` (gauge): open client connections

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::health::state::HealthState;

/// Install the Prometheus exporter with an HTTP scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, upstream: &str, start: Instant) {
    counter!(
        "router_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string(),
        "upstream" => upstream.to_string()
    )
    .increment(1);
    histogram!(
        "router_request_duration_seconds",
        "method" => method.to_string(),
        "upstream" => upstream.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_attempt(upstream: &str, outcome: &'static str) {
    counter!(
        "router_upstream_attempts_total",
        "upstream" => upstream.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_upstream_health(upstream: &str, state: HealthState) {
    let value = if state == HealthState::Healthy { 1.0 } else { 0.0 };
    gauge!("router_upstream_healthy", "upstream" => upstream.to_string()).set(value);
}

pub fn connection_opened() {
    gauge!("router_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("router_active_connections").decrement(1.0);
}
