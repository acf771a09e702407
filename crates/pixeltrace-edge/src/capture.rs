use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::{Map, Value};

use pixeltrace_core::record::{TrackingRecord, MAX_QUERY_STRING_BYTES, MAX_URL_BYTES};

use crate::state::AppState;

/// Header names always captured into `HeadersJson`. The config can extend
/// this set (client-hint headers are built in; TLS fingerprint hints ride
/// on the configured extras).
const BUILTIN_HEADERS: &[&str] = &[
    "user-agent",
    "referer",
    "accept-language",
    "accept",
    "accept-encoding",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "sec-ch-ua-platform-version",
    "sec-ch-ua-model",
    "sec-ch-ua-arch",
];

/// Why a request could not become a record.
#[derive(Debug, PartialEq)]
pub enum CaptureReject {
    /// Path does not match `/<company>/<pixel>_SMART.GIF`.
    BadPath,
    /// Query string or URL over the size limit.
    TooLarge,
}

/// Parse the pixel path: `/<company>/<pixel>_SMART.GIF`, suffix matched
/// case-insensitively. Returns (company, pixel).
pub fn parse_pixel_path(company: &str, pixel_file: &str) -> Option<(String, String)> {
    const SUFFIX: &str = "_SMART.GIF";
    if company.is_empty() || pixel_file.len() <= SUFFIX.len() {
        return None;
    }
    let (pixel, suffix) = pixel_file.split_at(pixel_file.len() - SUFFIX.len());
    if !suffix.eq_ignore_ascii_case(SUFFIX) || pixel.is_empty() {
        return None;
    }
    Some((company.to_string(), pixel.to_string()))
}

/// Build the `TrackingRecord` for one pixel request.
///
/// The query string is taken raw (size-checked, not parsed); the hit-type
/// tag is appended here so every downstream reader sees it. User-agent and
/// referer are truncated to their stored limits.
pub fn build_record(
    state: &AppState,
    company: String,
    pixel: String,
    raw_query: Option<&str>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<TrackingRecord, CaptureReject> {
    let query = raw_query.unwrap_or("");
    if query.len() > MAX_QUERY_STRING_BYTES {
        return Err(CaptureReject::TooLarge);
    }
    // The URL cap covers the path; the query string has its own limit.
    let request_path = format!("/{company}/{pixel}_SMART.GIF");
    if request_path.len() > MAX_URL_BYTES {
        return Err(CaptureReject::TooLarge);
    }

    let user_agent = header_str(headers, "user-agent");
    let referer = header_str(headers, "referer");

    let mut rec = TrackingRecord {
        received_at: Utc::now(),
        company_id: company,
        pixl_id: pixel,
        ip_address: client_ip(state, headers, peer),
        request_path,
        query_string: query.to_string(),
        headers_json: headers_json(state, headers),
        user_agent: TrackingRecord::clamp_header_field(&user_agent),
        referer: TrackingRecord::clamp_header_field(&referer),
    };

    // Hit-type classification: no query string at all means a legacy
    // (server-data-only) pixel.
    let hit_type = if query.is_empty() { "legacy" } else { "modern" };
    rec.append_srv("hitType", hit_type);
    Ok(rec)
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Client-IP resolution: the first `X-Forwarded-For` entry is honored only
/// when the transport peer is loopback or inside the configured trust
/// list; otherwise the transport peer address wins. CDN single-value
/// headers are deliberately ignored unless configured as extras.
pub fn client_ip(state: &AppState, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    if let Some(addr) = peer {
        let peer_ip = addr.ip();
        let trusted = peer_ip.is_loopback()
            || state
                .trusted_proxies
                .iter()
                .any(|net| net.contains(&peer_ip));
        if trusted {
            if let Some(forwarded) = forwarded {
                return forwarded.to_string();
            }
        }
        return peer_ip.to_string();
    }

    forwarded
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Serialize the known headers into a JSON object. serde_json handles the
/// required escaping (`"`, `\`, and all of U+0000..U+001F). An empty
/// capture set yields `{}`.
pub fn headers_json(state: &AppState, headers: &HeaderMap) -> String {
    let mut object = Map::new();
    for name in BUILTIN_HEADERS
        .iter()
        .copied()
        .chain(state.config.capture_headers.iter().map(String::as_str))
    {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            object.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_path_parses_case_insensitively() {
        assert_eq!(
            parse_pixel_path("12800", "100_SMART.GIF"),
            Some(("12800".to_string(), "100".to_string()))
        );
        assert_eq!(
            parse_pixel_path("DEMO", "deploy-test_smart.gif"),
            Some(("DEMO".to_string(), "deploy-test".to_string()))
        );
        assert_eq!(parse_pixel_path("12800", "100_SMART.PNG"), None);
        assert_eq!(parse_pixel_path("12800", "_SMART.GIF"), None);
        assert_eq!(parse_pixel_path("", "100_SMART.GIF"), None);
    }
}
