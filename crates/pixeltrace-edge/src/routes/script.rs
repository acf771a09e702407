use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
};

use crate::{error::AppError, state::AppState};

/// `GET /js/{company}/{pixel}.js` — serve the browser script with the
/// pixel URL baked in. The script body itself is an external artifact; the
/// template's `{{PIXEL_URL}}` placeholder is the only substitution.
pub async fn script(
    State(state): State<Arc<AppState>>,
    Path((company, pixel_file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let pixel = pixel_file.strip_suffix(".js").ok_or(AppError::NotFound)?;
    if company.is_empty() || pixel.is_empty() {
        return Err(AppError::NotFound);
    }

    let pixel_url = format!(
        "{}/{}/{}_SMART.GIF",
        state.config.public_url.trim_end_matches('/'),
        company,
        pixel
    );
    let body = state.script_template.replace("{{PIXEL_URL}}", &pixel_url);

    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok(response)
}
