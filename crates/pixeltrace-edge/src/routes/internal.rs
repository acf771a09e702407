use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::{error::AppError, routes::track::MaybeConnectInfo, state::AppState};

/// `GET /internal/health` — liveness plus the externally-readable gauges:
/// queue depth, drop counter, write counters, per-enrichment failures, and
/// pipe connectivity. 404 to callers outside loopback/allow-list.
pub async fn health(
    State(state): State<Arc<AppState>>,
    peer: MaybeConnectInfo,
) -> Result<impl IntoResponse, AppError> {
    guard(&state, &peer)?;
    let d = &state.dispatcher;
    let enrich_failures: serde_json::Map<String, serde_json::Value> = state
        .enrich_counters
        .snapshot()
        .into_iter()
        .map(|(name, count)| (name.to_string(), json!(count)))
        .collect();
    Ok(Json(json!({
        "ok": true,
        "queue_depth": d.depth(),
        "enqueued": d.enqueued_total(),
        "written": d.written_total(),
        "failover_written": d.failover_total(),
        "dropped": d.dropped_total(),
        "pipe_connected": d.pipe_connected(),
        "geo_hot_entries": state.geo_cache.hot_len(),
        "enrich_failures": enrich_failures,
    })))
}

/// `POST /internal/circuit-reset` — drop pipe state and reconnect now.
pub async fn circuit_reset(
    State(state): State<Arc<AppState>>,
    peer: MaybeConnectInfo,
) -> Result<impl IntoResponse, AppError> {
    guard(&state, &peer)?;
    state.dispatcher.request_reset();
    Ok(Json(json!({ "ok": true })))
}

/// `POST /internal/geo-cache/clear` — empty both cache tiers.
pub async fn geo_cache_clear(
    State(state): State<Arc<AppState>>,
    peer: MaybeConnectInfo,
) -> Result<impl IntoResponse, AppError> {
    guard(&state, &peer)?;
    state.geo_cache.clear_all();
    Ok(Json(json!({ "ok": true })))
}

/// Unauthorized callers get 404 — not 403 — so the endpoints' existence is
/// not disclosed.
fn guard(state: &AppState, peer: &MaybeConnectInfo) -> Result<(), AppError> {
    if state.control_authorized(peer.0.map(|addr| addr.ip())) {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}
