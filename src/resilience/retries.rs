//! Retry classification.
//!
//! # Responsibilities
//! - Classify a failed upstream attempt
//! - Decide whether the attempt may be replayed on another upstream
//!
//! # Design Decisions
//! - Connect failures are always retryable: the upstream never saw the request
//! - Timeouts and transport errors after the request was written are retried
//!   only for idempotent methods
//! - Upstream HTTP statuses are never retried; the response is relayed

use axum::http::Method;
use hyper_util::client::legacy::Error as ClientError;

/// Why an attempt produced no response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Could not establish a connection.
    Connect,
    /// No response headers within the per-attempt timeout.
    Timeout,
    /// The connection failed after the request was (possibly) sent.
    Transport,
}

impl AttemptFailure {
    pub fn from_client_error(err: &ClientError) -> Self {
        if err.is_connect() {
            AttemptFailure::Connect
        } else {
            AttemptFailure::Transport
        }
    }

    /// Whether the request may be sent again to a different upstream.
    pub fn is_retryable(self, method: &Method) -> bool {
        match self {
            AttemptFailure::Connect => true,
            AttemptFailure::Timeout | AttemptFailure::Transport => method.is_idempotent(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptFailure::Connect => "connect_error",
            AttemptFailure::Timeout => "timeout",
            AttemptFailure::Transport => "transport_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failures_retry_any_method() {
        assert!(AttemptFailure::Connect.is_retryable(&Method::POST));
        assert!(AttemptFailure::Connect.is_retryable(&Method::GET));
    }

    #[test]
    fn late_failures_retry_only_idempotent() {
        for failure in [AttemptFailure::Timeout, AttemptFailure::Transport] {
            assert!(failure.is_retryable(&Method::GET));
            assert!(failure.is_retryable(&Method::PUT));
            assert!(!failure.is_retryable(&Method::POST));
            assert!(!failure.is_retryable(&Method::PATCH));
        }
    }
}
