//! Per-request state.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) unless the client sent one
//! - Track the request through its routing state machine
//! - Carry the deadline, retry count and exclusion set across attempts
//!
//! # State Machine
//! ```text
//! Received → Selecting → Forwarding → Success
//!                ↑            │
//!                └─ Retrying ←┤
//!                             └→ Failed
//! Received  → Failed (unreadable request body)
//! Selecting → Failed (no eligible upstream)
//! Retrying  → Failed (deadline expired during backoff)
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method, Request};
use tokio::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Generates UUID v4 request IDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Where a request is in its routing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Selecting,
    Forwarding,
    Retrying,
    Success,
    Failed,
}

impl RequestPhase {
    pub fn can_transition_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, Selecting)
                | (Received, Failed)
                | (Selecting, Forwarding)
                | (Selecting, Failed)
                | (Forwarding, Success)
                | (Forwarding, Retrying)
                | (Forwarding, Failed)
                | (Retrying, Selecting)
                | (Retrying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Success | RequestPhase::Failed)
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State carried by one inbound request across upstream attempts.
#[derive(Debug)]
pub struct RequestContext {
    request_id: String,
    client_addr: SocketAddr,
    method: Method,
    path: String,
    deadline: Instant,
    retries: u32,
    max_retries: u32,
    excluded: HashSet<String>,
    phase: RequestPhase,
}

impl RequestContext {
    pub fn new(
        request_id: impl Into<String>,
        client_addr: SocketAddr,
        method: Method,
        path: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_addr,
            method,
            path: path.into(),
            deadline: Instant::now() + timeout,
            retries: 0,
            max_retries,
            excluded: HashSet::new(),
            phase: RequestPhase::Received,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts performed so far, counting the one in progress.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    /// Lower the retry budget, e.g. when the body cannot be replayed.
    pub fn limit_retries(&mut self, max_retries: u32) {
        self.max_retries = self.max_retries.min(max_retries);
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Upstreams that already failed this request.
    pub fn excluded(&self) -> &HashSet<String> {
        &self.excluded
    }

    /// Exclude a failed upstream and count the retry.
    pub fn begin_retry(&mut self, failed_upstream: &str) {
        self.excluded.insert(failed_upstream.to_string());
        self.retries += 1;
        self.transition(RequestPhase::Retrying);
    }

    pub fn transition(&mut self, next: RequestPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid request transition {} -> {}",
            self.phase,
            next
        );
        tracing::trace!(
            request_id = %self.request_id,
            from = %self.phase,
            to = %next,
            "Request phase change"
        );
        self.phase = next;
    }
}
