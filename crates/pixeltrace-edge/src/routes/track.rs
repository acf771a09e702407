use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};

use crate::{
    capture::{self, CaptureReject},
    enrich::{self, EnrichContext},
    error::AppError,
    state::AppState,
};

/// The 43-byte transparent GIF served for every valid pixel path.
pub const TRANSPARENT_GIF: &[u8] = &[
    71, 73, 70, 56, 57, 97, 1, 0, 1, 0, 128, 0, 0, 0, 0, 0, 255, 255, 255, 33, 249, 4, 1, 0, 0, 0,
    0, 44, 0, 0, 0, 0, 1, 0, 1, 0, 0, 2, 2, 68, 1, 0, 59,
];

/// Socket metadata is absent under `tower::ServiceExt::oneshot` in tests;
/// capture treats a missing peer as untrusted.
#[derive(Debug)]
pub struct MaybeConnectInfo(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for MaybeConnectInfo
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0),
        ))
    }
}

/// `GET /{company}/{pixel}_SMART.GIF` — the ingest hot path.
///
/// Capture happens inline (it is a struct fill); the twelve enrichments
/// and the dispatcher hand-off run on a spawned task so no side effect is
/// ever on the response path. A valid pixel path always gets a 200 GIF;
/// anything else 404; an oversized query 400.
pub async fn track(
    State(state): State<Arc<AppState>>,
    Path((company, pixel_file)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    maybe_connect_info: MaybeConnectInfo,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (company, pixel) =
        capture::parse_pixel_path(&company, &pixel_file).ok_or(AppError::NotFound)?;

    let record = capture::build_record(
        &state,
        company,
        pixel,
        raw_query.as_deref(),
        &headers,
        maybe_connect_info.0,
    )
    .map_err(|reject| match reject {
        CaptureReject::TooLarge => AppError::BadRequest("request exceeds size limit".to_string()),
        CaptureReject::BadPath => AppError::NotFound,
    })?;

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut record = record;
        let headers_value: serde_json::Value =
            serde_json::from_str(&record.headers_json).unwrap_or_default();
        let ctx = EnrichContext::from_record(&record, &headers_value);
        enrich::apply_fast(&task_state, &mut record, &ctx);
        task_state.dispatcher.enqueue(record);
    });

    Ok(gif_response())
}

pub fn gif_response() -> Response {
    let mut response = Response::new(axum::body::Body::from(TRANSPARENT_GIF));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    response
        .headers_mut()
        .insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}
