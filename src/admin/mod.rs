//! Admin API.
//!
//! Served on its own listener, guarded by a bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::registry::Registry;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(registry: Arc<Registry>, api_key: &str) -> Self {
        Self {
            registry,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/upstreams", get(get_upstreams))
        .route("/admin/upstreams/{id}/drain", post(drain_upstream))
        .route("/admin/upstreams/{id}/undrain", post(undrain_upstream))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
