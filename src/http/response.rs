//! Response handling and transformation.
//!
//! # Responsibilities
//! - Relay upstream responses to the client without buffering the body
//! - Strip hop-by-hop headers from upstream responses
//! - Map routing failures to gateway statuses
//!
//! # Design Decisions
//! - Once headers are relayed the body streams under the request deadline;
//!   an upstream error or expiry mid-body aborts the client connection
//! - The upstream in-flight slot is released when the body finishes or the
//!   client goes away, not when headers arrive

use axum::body::{Body, Bytes};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use futures_util::stream::{self, StreamExt};
use hyper::body::Incoming;
use thiserror::Error;
use tokio::time::Instant;

use crate::http::headers::strip_hop_by_hop;
use crate::load_balancer::SelectError;
use crate::registry::UpstreamGuard;

/// A request the router could not satisfy via any upstream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no healthy upstream available")]
    NoHealthyUpstream,

    #[error("all upstreams are at their connection limit")]
    UpstreamsSaturated,

    #[error("upstream request failed after {attempts} attempt(s)")]
    AttemptsExhausted { attempts: u32 },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("failed to read request body: {0}")]
    ClientBody(#[source] axum::Error),

    #[error("request body not received before the deadline")]
    ClientBodyTimeout,

    #[error("failed to build upstream request: {0}")]
    InvalidRequest(#[from] axum::http::Error),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoHealthyUpstream | ProxyError::UpstreamsSaturated => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::AttemptsExhausted { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::ClientBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::ClientBodyTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<SelectError> for ProxyError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoHealthyUpstream => ProxyError::NoHealthyUpstream,
            SelectError::AtCapacity => ProxyError::UpstreamsSaturated,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Why a relayed body stopped early.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("upstream body failed: {0}")]
    Upstream(#[source] axum::Error),

    #[error("request deadline exceeded while streaming")]
    DeadlineExceeded,
}

struct RelayState {
    body: axum::body::BodyDataStream,
    guard: UpstreamGuard,
    request_id: String,
    done: bool,
}

/// Turn an upstream response into the client response.
pub fn relay_response(
    response: Response<Incoming>,
    guard: UpstreamGuard,
    request_id: &str,
    deadline: Instant,
) -> Response<Body> {
    let (mut parts, incoming) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let state = RelayState {
        body: Body::new(incoming).into_data_stream(),
        guard,
        request_id: request_id.to_string(),
        done: false,
    };

    let body = stream::unfold(state, move |mut state| async move {
        if state.done {
            return None;
        }
        match tokio::time::timeout_at(deadline, state.body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok::<Bytes, StreamError>(chunk), state)),
            Ok(None) => None,
            Ok(Some(Err(e))) => {
                tracing::warn!(
                    request_id = %state.request_id,
                    upstream = %state.guard.id(),
                    error = %e,
                    "Upstream failed mid-stream, closing client connection"
                );
                state.done = true;
                Some((Err(StreamError::Upstream(e)), state))
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %state.request_id,
                    upstream = %state.guard.id(),
                    "Deadline expired mid-stream, closing client connection"
                );
                state.done = true;
                Some((Err(StreamError::DeadlineExceeded), state))
            }
        }
    });

    Response::from_parts(parts, Body::from_stream(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_statuses() {
        assert_eq!(ProxyError::NoHealthyUpstream.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ProxyError::UpstreamsSaturated.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ProxyError::AttemptsExhausted { attempts: 3 }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::DeadlineExceeded.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyError::ClientBodyTimeout.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn select_errors_map_to_proxy_errors() {
        assert!(matches!(
            ProxyError::from(SelectError::NoHealthyUpstream),
            ProxyError::NoHealthyUpstream
        ));
        assert!(matches!(
            ProxyError::from(SelectError::AtCapacity),
            ProxyError::UpstreamsSaturated
        ));
    }

    #[test]
    fn error_response_carries_status() {
        let response = ProxyError::AttemptsExhausted { attempts: 2 }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
