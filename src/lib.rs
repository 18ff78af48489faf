//! Reverse-proxy upstream router.
//!
//! Distributes client HTTP requests across a pool of upstream servers,
//! probes their health in the background, and retries failed attempts on a
//! different upstream.

pub mod admin;
pub mod config;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::{start, RunningProxy, Shutdown};
pub use registry::Registry;
