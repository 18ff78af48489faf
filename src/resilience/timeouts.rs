//! Deadline arithmetic.
//!
//! Every wait on the request path is bounded by the request deadline; a
//! per-attempt timeout can only shorten it.

use std::time::Duration;

use tokio::time::Instant;

/// When the current attempt must have produced response headers.
pub fn attempt_deadline(request_deadline: Instant, per_attempt: Duration) -> Instant {
    (Instant::now() + per_attempt).min(request_deadline)
}

/// True once the request deadline has passed.
pub fn is_expired(request_deadline: Instant) -> bool {
    Instant::now() >= request_deadline
}
