//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate upstream addresses and uniqueness
//! - Validate value ranges (thresholds > 0, probe timeout below interval)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system, both at startup and on reload

use std::collections::HashSet;
use std::net::SocketAddr;
use std::str::FromStr;

use axum::http::uri::Authority;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("no upstreams configured")]
    NoUpstreams,

    #[error("invalid upstream address `{address}`: {reason}")]
    InvalidUpstreamAddress { address: String, reason: String },

    #[error("duplicate upstream `{0}`")]
    DuplicateUpstream(String),

    #[error("upstream `{0}` has weight 0")]
    ZeroWeight(String),

    #[error("upstream `{0}` has max_connections 0")]
    ZeroUpstreamConnections(String),

    #[error("invalid socket address for {field}: `{address}`")]
    InvalidBindAddress { field: &'static str, address: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("health check timeout ({timeout_ms}ms) must be below the interval ({interval_ms}ms)")]
    ProbeTimeoutNotBelowInterval { timeout_ms: u64, interval_ms: u64 },

    #[error("health check path `{0}` must start with '/'")]
    InvalidHealthPath(String),

    #[error("admin API is enabled but admin.api_key is empty")]
    MissingAdminKey,
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_socket_addr(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }

    if config.upstreams.is_empty() {
        errors.push(ValidationError::NoUpstreams);
    }
    let mut seen = HashSet::new();
    for upstream in &config.upstreams {
        if let Err(reason) = validate_upstream_address(&upstream.address) {
            errors.push(ValidationError::InvalidUpstreamAddress {
                address: upstream.address.clone(),
                reason,
            });
        }
        if !seen.insert(upstream.address.as_str()) {
            errors.push(ValidationError::DuplicateUpstream(upstream.address.clone()));
        }
        if upstream.weight == 0 {
            errors.push(ValidationError::ZeroWeight(upstream.address.clone()));
        }
        if upstream.max_connections == 0 {
            errors.push(ValidationError::ZeroUpstreamConnections(upstream.address.clone()));
        }
    }

    let health = &config.health_check;
    if !health.path.starts_with('/') {
        errors.push(ValidationError::InvalidHealthPath(health.path.clone()));
    }
    if health.interval_ms == 0 {
        errors.push(ValidationError::Zero("health_check.interval_ms"));
    }
    if health.timeout_ms == 0 {
        errors.push(ValidationError::Zero("health_check.timeout_ms"));
    }
    if health.timeout_ms >= health.interval_ms {
        errors.push(ValidationError::ProbeTimeoutNotBelowInterval {
            timeout_ms: health.timeout_ms,
            interval_ms: health.interval_ms,
        });
    }
    if health.unhealthy_threshold == 0 {
        errors.push(ValidationError::Zero("health_check.unhealthy_threshold"));
    }
    if health.healthy_threshold == 0 {
        errors.push(ValidationError::Zero("health_check.healthy_threshold"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.request_secs"));
    }
    if config.timeouts.connect_ms == 0 {
        errors.push(ValidationError::Zero("timeouts.connect_ms"));
    }
    if config.timeouts.response_header_ms == 0 {
        errors.push(ValidationError::Zero("timeouts.response_header_ms"));
    }

    if config.observability.metrics_enabled {
        check_socket_addr(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    if config.admin.enabled {
        check_socket_addr(&mut errors, "admin.bind_address", &config.admin.bind_address);
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::MissingAdminKey);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that an upstream identifier is a plain `host:port` authority.
pub fn validate_upstream_address(address: &str) -> Result<(), String> {
    let authority = Authority::from_str(address).map_err(|e| e.to_string())?;
    if address.contains('@') {
        return Err("credentials are not allowed".to_string());
    }
    if authority.host().is_empty() {
        return Err("missing host".to_string());
    }
    match authority.port_u16() {
        Some(0) => Err("port must be non-zero".to_string()),
        Some(_) => Ok(()),
        None => Err("missing port".to_string()),
    }
}

fn check_socket_addr(errors: &mut Vec<ValidationError>, field: &'static str, address: &str) {
    if SocketAddr::from_str(address).is_err() {
        errors.push(ValidationError::InvalidBindAddress {
            field,
            address: address.to_string(),
        });
    }
}
