//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Client connection
//!     → server.rs (Axum setup, proxy handler)
//!     → request.rs (request ID, routing state, retry budget)
//!     → headers.rs (hop-by-hop removal, X-Forwarded-*)
//!     → [load balancer picks upstream, retried on a different one on failure]
//!     → response.rs (stream upstream response, map failures to 502/503/504)
//!     → Send to client
//! ```

pub mod headers;
pub mod request;
pub mod response;
pub mod server;

pub use request::{RequestContext, RequestPhase, X_REQUEST_ID};
pub use response::ProxyError;
pub use server::HttpServer;
