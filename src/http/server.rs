//! HTTP server setup and the proxy handler.
//!
//! # Responsibilities
//! - Create the Axum Router with the catch-all proxy handler
//! - Wire up middleware (request ID, tracing)
//! - Accept client connections and serve each on its own task
//! - Forward requests to upstreams with retry-without-repeat

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{ConnectInfo, State},
    http::{
        request::Parts,
        uri::{Authority, PathAndQuery, Scheme},
        Request, Uri,
    },
    response::{IntoResponse, Response},
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::sync::broadcast;
use tokio::time;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{ProxyConfig, RetryConfig, TimeoutConfig};
use crate::http::headers::{apply_forwarding_headers, strip_hop_by_hop};
use crate::http::request::{MakeRequestUuid, RequestContext, RequestPhase, X_REQUEST_ID};
use crate::http::response::{relay_response, ProxyError};
use crate::load_balancer::{Balancer, SelectError};
use crate::net::connection::{self, ConnectionTracker};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;
use crate::registry::{Registry, UpstreamGuard};
use crate::resilience::{backoff::retry_backoff, retries::AttemptFailure, timeouts};

/// Shared state behind every request.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<ProxyState>,
}

struct ProxyState {
    balancer: Balancer,
    client: Client<HttpConnector, Body>,
    retries: RetryConfig,
    timeouts: TimeoutConfig,
}

/// HTTP server for the router.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a new HTTP server over an existing registry.
    pub fn new(config: ProxyConfig, registry: Arc<Registry>) -> Self {
        let balancer = Balancer::new(registry, config.balancer.algorithm);

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.timeouts.connect()));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.timeouts.pool_idle())
            .build(connector);

        let state = AppState {
            inner: Arc::new(ProxyState {
                balancer,
                client,
                retries: config.retries.clone(),
                timeouts: config.timeouts.clone(),
            }),
        };

        let router = Self::build_router(state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(X_REQUEST_ID)),
            )
    }

    /// The request router, for serving on a custom transport.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Accept connections until shutdown, then drain open connections.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %addr, "HTTP server starting");

        let tracker = ConnectionTracker::new();
        let keep_alive = self.config.listener.keep_alive;

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => break,
            };
            let (stream, peer, permit) = match accepted {
                Ok(conn) => conn,
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };

            let guard = tracker.track();
            let app = self.router.clone();
            let conn_shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                connection::serve(stream, peer, app, keep_alive, conn_shutdown, guard, permit).await;
            });
        }

        tracing::info!(
            open_connections = tracker.active_count(),
            "Listener closed, draining connections"
        );
        if !tracker.wait_idle(self.config.listener.drain_timeout()).await {
            tracing::warn!(
                open_connections = tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Main proxy handler.
/// Selects an upstream, forwards the request, retries on a different upstream
/// when an attempt fails before the response starts.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start_time = Instant::now();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let method = request.method().clone();

    let mut ctx = RequestContext::new(
        request_id,
        client_addr,
        method.clone(),
        request.uri().path(),
        state.inner.timeouts.request(),
        state.inner.retries.max_retries,
    );

    tracing::debug!(
        request_id = %ctx.request_id(),
        client = %client_addr,
        method = %method,
        path = %ctx.path(),
        "Proxying request"
    );

    match forward(&state.inner, &mut ctx, request).await {
        Ok((response, upstream)) => {
            metrics::record_request(method.as_str(), response.status().as_u16(), &upstream, start_time);
            response
        }
        Err(err) => {
            if !ctx.phase().is_terminal() {
                ctx.transition(RequestPhase::Failed);
            }
            tracing::warn!(
                request_id = %ctx.request_id(),
                attempts = ctx.attempts(),
                error = %err,
                "Request failed"
            );
            metrics::record_request(method.as_str(), err.status().as_u16(), "none", start_time);
            err.into_response()
        }
    }
}

/// Request body prepared for one or more attempts.
enum ForwardBody {
    /// Fully buffered; can be sent again.
    Replayable(Bytes),
    /// Streamed through once.
    OneShot(Option<Body>),
}

impl ForwardBody {
    async fn prepare(body: Body, limit: usize) -> Result<Self, ProxyError> {
        match body.size_hint().exact() {
            Some(len) if len <= limit as u64 => axum::body::to_bytes(body, limit)
                .await
                .map(ForwardBody::Replayable)
                .map_err(ProxyError::ClientBody),
            _ => Ok(ForwardBody::OneShot(Some(body))),
        }
    }

    fn is_replayable(&self) -> bool {
        matches!(self, ForwardBody::Replayable(_))
    }

    fn for_attempt(&mut self) -> Body {
        match self {
            ForwardBody::Replayable(bytes) => Body::from(bytes.clone()),
            ForwardBody::OneShot(body) => body.take().unwrap_or_else(Body::empty),
        }
    }
}

/// Drive the Selecting → Forwarding → (Success | Retrying | Failed) loop.
///
/// Returns the client response and the id of the upstream that produced it.
async fn forward(
    state: &ProxyState,
    ctx: &mut RequestContext,
    request: Request<Body>,
) -> Result<(Response, String), ProxyError> {
    let (mut parts, body) = request.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let authority = parts.uri.authority().cloned();
    apply_forwarding_headers(&mut parts.headers, ctx.client_addr(), authority.as_ref());

    // A client that stalls mid-body must not outlive the request deadline.
    let prepared = time::timeout_at(
        ctx.deadline(),
        ForwardBody::prepare(body, state.retries.max_buffered_body_bytes),
    )
    .await;
    let mut body = match prepared {
        Ok(body) => body?,
        Err(_) => return Err(ProxyError::ClientBodyTimeout),
    };
    if !body.is_replayable() {
        ctx.limit_retries(0);
    }

    loop {
        ctx.transition(RequestPhase::Selecting);
        let upstream = match state.balancer.select(ctx.excluded()) {
            Ok(upstream) => upstream,
            // Every remaining upstream already failed this request.
            Err(SelectError::NoHealthyUpstream) if ctx.retries() > 0 => {
                return Err(ProxyError::AttemptsExhausted {
                    attempts: ctx.retries(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        ctx.transition(RequestPhase::Forwarding);
        let upstream_request = build_upstream_request(&parts, &upstream, body.for_attempt())?;
        let attempt_deadline =
            timeouts::attempt_deadline(ctx.deadline(), state.timeouts.response_header());

        let failure = match time::timeout_at(attempt_deadline, state.client.request(upstream_request)).await {
            Ok(Ok(response)) => {
                metrics::record_attempt(upstream.id(), "ok");
                ctx.transition(RequestPhase::Success);
                tracing::debug!(
                    request_id = %ctx.request_id(),
                    upstream = %upstream.id(),
                    status = %response.status(),
                    attempts = ctx.attempts(),
                    "Upstream responded"
                );
                let upstream_id = upstream.id().to_string();
                let response = relay_response(response, upstream, ctx.request_id(), ctx.deadline());
                return Ok((response.into_response(), upstream_id));
            }
            Ok(Err(e)) => {
                let failure = AttemptFailure::from_client_error(&e);
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    upstream = %upstream.id(),
                    attempt = ctx.attempts(),
                    error = %e,
                    "Upstream attempt failed"
                );
                failure
            }
            Err(_) if timeouts::is_expired(ctx.deadline()) => {
                metrics::record_attempt(upstream.id(), AttemptFailure::Timeout.as_str());
                return Err(ProxyError::DeadlineExceeded);
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    upstream = %upstream.id(),
                    attempt = ctx.attempts(),
                    "Upstream attempt timed out"
                );
                AttemptFailure::Timeout
            }
        };
        metrics::record_attempt(upstream.id(), failure.as_str());

        if !ctx.can_retry() || !failure.is_retryable(ctx.method()) {
            return Err(ProxyError::AttemptsExhausted {
                attempts: ctx.attempts(),
            });
        }

        ctx.begin_retry(upstream.id());
        drop(upstream);

        let backoff = retry_backoff(ctx.retries(), &state.retries);
        tracing::info!(
            request_id = %ctx.request_id(),
            retry = ctx.retries(),
            delay = ?backoff,
            reason = failure.as_str(),
            "Retrying on another upstream"
        );
        time::sleep_until((time::Instant::now() + backoff).min(ctx.deadline())).await;
        if timeouts::is_expired(ctx.deadline()) {
            return Err(ProxyError::DeadlineExceeded);
        }
    }
}

/// Copy the client request onto the selected upstream's authority.
fn build_upstream_request(
    parts: &Parts,
    upstream: &UpstreamGuard,
    body: Body,
) -> Result<Request<Body>, ProxyError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(Authority::from_str(upstream.id()).map_err(axum::http::Error::from)?)
        .path_and_query(path_and_query)
        .build()?;

    let mut request = Request::builder().method(parts.method.clone()).uri(uri);
    if let Some(headers) = request.headers_mut() {
        headers.extend(parts.headers.clone());
    }
    Ok(request.body(body)?)
}
