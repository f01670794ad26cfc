//! Management API handlers

use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RotorError;
use crate::models::UpstreamInfo;

use super::server::AppState;

/// How long handlers wait for the rotation worker before reading the
/// current upstream, so responses reflect the rotation they caused.
const ROTATION_SETTLE: Duration = Duration::from_millis(50);

/// Payload for POST /api/status.
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    /// HTTP status code the client application received.
    pub status: u16,
    /// Target domain (host or host:port).
    #[serde(default)]
    pub destination: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub rotated: bool,
}

#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub ok: bool,
    pub proxy: String,
}

/// GET /api/current: the currently active upstream.
pub async fn current(State(state): State<AppState>) -> Result<impl IntoResponse, RotorError> {
    let cur = state.rotator.current().ok_or(RotorError::NoActiveUpstream)?;
    Ok(Json(UpstreamInfo::from(cur.as_ref())))
}

/// GET /api/pool: every upstream; the active one gets its address
/// prefixed with `[ACTIVE] `.
pub async fn pool(State(state): State<AppState>) -> Result<impl IntoResponse, RotorError> {
    let current_id = state.rotator.current().map(|cur| cur.id);

    let infos: Vec<UpstreamInfo> = state
        .pool
        .all()
        .iter()
        .map(|up| {
            let mut info = UpstreamInfo::from(up.as_ref());
            if current_id == Some(up.id) {
                info.address = format!("[ACTIVE] {}", info.address);
            }
            info
        })
        .collect();

    Ok(Json(infos))
}

/// POST /api/rotate: queue a manual rotation and report the new upstream.
pub async fn rotate(State(state): State<AppState>) -> Result<impl IntoResponse, RotorError> {
    state.rotator.force_rotate();
    // Give the rotation worker a moment to process the trigger.
    tokio::time::sleep(ROTATION_SETTLE).await;

    let proxy = state
        .rotator
        .current()
        .map(|cur| cur.to_string())
        .unwrap_or_default();
    info!(%proxy, "manual rotation triggered");
    Ok(Json(RotateResponse { ok: true, proxy }))
}

/// POST /api/status: status report from the client application. 2xx and
/// 3xx are healthy and ignored; anything else counts as an HTTP error for
/// the destination.
pub async fn status(
    State(state): State<AppState>,
    Json(req): Json<StatusRequest>,
) -> Result<impl IntoResponse, RotorError> {
    if req.destination.is_empty() {
        return Err(RotorError::InvalidRequest(
            "destination is required".to_string(),
        ));
    }

    if (200..400).contains(&req.status) {
        return Ok(Json(StatusResponse {
            ok: true,
            rotated: false,
        }));
    }

    let generation_before = state.rotator.generation();
    state.rotator.report_http_error(&req.destination);
    tokio::time::sleep(ROTATION_SETTLE).await;
    let rotated = state.rotator.generation() != generation_before;

    info!(
        status = req.status,
        destination = %req.destination,
        rotated,
        "status report"
    );
    Ok(Json(StatusResponse { ok: true, rotated }))
}
