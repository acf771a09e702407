use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{routes, state::AppState};

/// The public ingest router: the pixel path and the script endpoint, with
/// request tracing outermost. No CORS layer — the pixel is an image fetch
/// and needs none.
pub fn build_ingest_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/js/{company}/{pixel_file}", get(routes::script::script))
        .route("/{company}/{pixel_file}", get(routes::track::track))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The loopback control router, served on its own port. Route-level
/// authorization (loopback + allow-list, 404 otherwise) lives in the
/// handlers.
pub fn build_internal_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/internal/health", get(routes::internal::health))
        .route(
            "/internal/circuit-reset",
            post(routes::internal::circuit_reset),
        )
        .route(
            "/internal/geo-cache/clear",
            post(routes::internal::geo_cache_clear),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
