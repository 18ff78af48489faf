use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::AdminState;
use crate::registry::{RegistryError, UpstreamStatus};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub generation: u64,
    pub upstreams: usize,
    pub selectable: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let snapshot = state.registry.list();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        uptime_secs: state.started.elapsed().as_secs(),
        generation: snapshot.generation(),
        upstreams: snapshot.len(),
        selectable: snapshot.iter().filter(|u| u.is_selectable()).count(),
    })
}

pub async fn get_upstreams(State(state): State<AdminState>) -> Json<Vec<UpstreamStatus>> {
    let snapshot = state.registry.list();
    Json(snapshot.iter().map(|u| u.status()).collect())
}

pub async fn drain_upstream(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<UpstreamStatus>, AdminError> {
    set_draining(&state, &id, true)
}

pub async fn undrain_upstream(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<UpstreamStatus>, AdminError> {
    set_draining(&state, &id, false)
}

fn set_draining(
    state: &AdminState,
    id: &str,
    draining: bool,
) -> Result<Json<UpstreamStatus>, AdminError> {
    state.registry.set_draining(id, draining)?;
    let upstream = state
        .registry
        .get(id)
        .ok_or_else(|| RegistryError::UnknownUpstream(id.to_string()))?;
    Ok(Json(upstream.status()))
}

/// Admin API failure.
#[derive(Debug)]
pub struct AdminError(RegistryError);

impl From<RegistryError> for AdminError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RegistryError::UnknownUpstream(_) => StatusCode::NOT_FOUND,
            RegistryError::DuplicateUpstream(_) | RegistryError::Empty => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
