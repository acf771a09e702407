use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use pixeltrace_core::config::Config;
use pixeltrace_duckdb::GeoStore;
use pixeltrace_edge::{app, dispatch::Dispatcher, geocache::GeoCache, state::AppState};

async fn test_state() -> Arc<AppState> {
    let cfg = Config::from_env().unwrap();
    let geo_cache = GeoCache::new(Arc::new(GeoStore::open_in_memory().unwrap()));
    Arc::new(AppState::new(cfg, Arc::new(Dispatcher::new(64)), geo_cache))
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn valid_pixel_path_serves_the_gif() {
    let state = test_state().await;
    let app = app::build_ingest_app(Arc::clone(&state));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/12800/100_SMART.GIF?sw=1920&sh=1080&cv=abc&ua=Mozilla%2F5.0")
                .header("user-agent", "Mozilla/5.0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/gif"
    );
    let body = body_bytes(response).await;
    assert_eq!(body.len(), 43);
    assert_eq!(&body[0..6], b"GIF89a");

    // The capture lands on the dispatcher once the enrichment task runs.
    for _ in 0..100 {
        if state.dispatcher.enqueued_total() == 1 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("record never reached the dispatcher");
}

#[tokio::test]
async fn suffix_match_is_case_insensitive() {
    let state = test_state().await;
    let app = app::build_ingest_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/DEMO/deploy-test_smart.gif?verify=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn malformed_path_is_404() {
    let state = test_state().await;
    let app = app::build_ingest_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/12800/100_TRACK.GIF")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn query_at_the_limit_is_accepted_and_over_is_rejected() {
    let state = test_state().await;

    // Exactly 16384 bytes of query: accepted.
    let at_limit = format!("a={}", "x".repeat(16_382));
    assert_eq!(at_limit.len(), 16_384);
    let response = app::build_ingest_app(Arc::clone(&state))
        .oneshot(
            Request::builder()
                .uri(format!("/1/1_SMART.GIF?{at_limit}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // One byte more: 400.
    let over_limit = format!("a={}", "x".repeat(16_383));
    let response = app::build_ingest_app(state)
        .oneshot(
            Request::builder()
                .uri(format!("/1/1_SMART.GIF?{over_limit}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn script_endpoint_bakes_in_the_pixel_url() {
    let state = test_state().await;
    let app = app::build_ingest_app(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/js/12800/100.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("/12800/100_SMART.GIF"));
    assert!(!body.contains("{{PIXEL_URL}}"));
}

#[tokio::test]
async fn capture_tags_hit_type_and_truncates_headers() {
    use axum::http::HeaderMap;
    use pixeltrace_edge::capture;

    let state = test_state().await;
    let mut headers = HeaderMap::new();
    headers.insert("user-agent", "x".repeat(5_000).parse().unwrap());
    headers.insert("accept-language", "en-US,en;q=0.9".parse().unwrap());

    let modern = capture::build_record(
        &state,
        "12800".to_string(),
        "100".to_string(),
        Some("sw=1920&sh=1080"),
        &headers,
        None,
    )
    .unwrap();
    assert!(modern.query_string.contains("_srv_hitType=modern"));
    assert_eq!(modern.user_agent.len(), 2_000);
    assert!(modern.headers_json.contains("accept-language"));

    let legacy = capture::build_record(
        &state,
        "12800".to_string(),
        "100".to_string(),
        None,
        &HeaderMap::new(),
        None,
    )
    .unwrap();
    assert!(legacy.query_string.contains("_srv_hitType=legacy"));
    assert_eq!(legacy.headers_json, "{}");
}

#[tokio::test]
async fn control_endpoints_hide_behind_404_without_peer_identity() {
    let state = test_state().await;
    // oneshot carries no socket metadata: the caller cannot be verified as
    // loopback, so the endpoint pretends not to exist.
    let response = app::build_internal_app(state)
        .oneshot(
            Request::builder()
                .uri("/internal/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
