use chrono::{TimeZone, Utc};
use pixeltrace_core::record::TrackingRecord;
use pixeltrace_duckdb::StoreBackend;

fn record(company: &str, pixel: &str, ip: &str, query: &str) -> TrackingRecord {
    TrackingRecord {
        received_at: Utc.with_ymd_and_hms(2026, 5, 10, 12, 0, 0).unwrap(),
        company_id: company.to_string(),
        pixl_id: pixel.to_string(),
        ip_address: ip.to_string(),
        request_path: format!("/{company}/{pixel}_SMART.GIF"),
        query_string: query.to_string(),
        headers_json: "{}".to_string(),
        user_agent: "Mozilla/5.0".to_string(),
        referer: String::new(),
    }
}

#[tokio::test]
async fn etl_parses_one_row_per_raw_row() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[
        record("12800", "100", "203.0.113.9", "sw=1920&sh=1080&_srv_hitType=modern"),
        record("12800", "100", "203.0.113.10", "sw=1366&sh=768&_srv_hitType=modern"),
    ])
    .await
    .unwrap();

    let outcome = db.run_etl_batch(10_000).await.unwrap();
    assert_eq!(outcome.rows_parsed, 2);
    assert_eq!(outcome.visits_inserted, 2);
    assert_eq!(outcome.new_watermark, 2);
}

#[tokio::test]
async fn etl_rerun_with_no_new_rows_is_a_no_op() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record("1", "2", "198.51.100.7", "sw=800")])
        .await
        .unwrap();

    let first = db.run_etl_batch(10_000).await.unwrap();
    assert_eq!(first.rows_parsed, 1);

    let second = db.run_etl_batch(10_000).await.unwrap();
    assert_eq!(second.rows_parsed, 0);
    assert_eq!(second.visits_inserted, 0);
    assert_eq!(second.new_watermark, first.new_watermark);
}

#[tokio::test]
async fn client_params_extract_to_json_and_match_email() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record(
        "12800",
        "100",
        "203.0.113.9",
        "_cp_email=alice%40test.com&_cp_hid=12345&sw=1920",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let (json, email): (String, String) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT client_params_json, match_email FROM visits WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(json, r#"{"email":"alice@test.com","hid":"12345"}"#);
    assert_eq!(email, "alice@test.com");
}

#[tokio::test]
async fn device_hash_dimension_is_unique_across_batches() {
    let db = StoreBackend::open_in_memory().unwrap();
    let fp = "cv=abc&fonts=Arial%2CHelvetica&gr=Apple%20M1&wgl=w1&au=a1";
    db.insert_raw_batch(&[record("1", "1", "203.0.113.1", fp)])
        .await
        .unwrap();
    db.run_etl_batch(10_000).await.unwrap();
    db.insert_raw_batch(&[record("1", "1", "203.0.113.2", fp)])
        .await
        .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let (devices, hits): (i64, i64) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), SUM(hit_count) FROM devices",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(devices, 1, "same fingerprint must merge into one device row");
    assert_eq!(hits, 2);

    // Both visits resolve to the same surrogate id.
    let distinct: i64 = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(DISTINCT device_id) FROM visits",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(distinct, 1);
}

#[tokio::test]
async fn legacy_hit_has_null_device_hash_and_no_device_row() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record("5", "6", "203.0.113.1", "")])
        .await
        .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let (hash, hit_type): (Option<String>, String) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT device_hash, hit_type FROM parsed_hits WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(hash, None);
    assert_eq!(hit_type, "legacy");

    let devices: i64 = db
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(devices, 0);

    // Numeric company + pixel still produce a visit, with a null device id.
    let device_id: Option<i64> = db
        .with_conn(|conn| {
            Ok(conn.query_row("SELECT device_id FROM visits WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert_eq!(device_id, None);
}

#[tokio::test]
async fn non_numeric_company_produces_no_visit() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record("DEMO", "deploy-test", "127.0.0.1", "verify=1")])
        .await
        .unwrap();
    let outcome = db.run_etl_batch(10_000).await.unwrap();
    assert_eq!(outcome.rows_parsed, 1);
    assert_eq!(outcome.visits_inserted, 0);

    // The parsed row still exists; only the visit is skipped.
    let parsed: i64 = db
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM parsed_hits", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(parsed, 1);
}

#[tokio::test]
async fn srv_params_land_in_typed_columns() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record(
        "7",
        "8",
        "198.51.100.77",
        "sw=1920&_srv_subnetAlert=1&_srv_geoCC=US&_srv_browser=Chrome&_srv_leadScore=72",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let (alert, cc, browser, lead): (bool, String, String, i32) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT srv_subnet_alert, srv_geo_cc, srv_browser, lead_score \
                 FROM parsed_hits WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?)
        })
        .await
        .unwrap();
    assert!(alert);
    assert_eq!(cc, "US");
    assert_eq!(browser, "Chrome");
    assert_eq!(lead, 72);
}

#[tokio::test]
async fn watermark_only_advances_with_committed_work() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[
        record("1", "1", "203.0.113.1", "a=1"),
        record("1", "1", "203.0.113.2", "a=2"),
        record("1", "1", "203.0.113.3", "a=3"),
    ])
    .await
    .unwrap();

    // Batch limit of 2 leaves one row behind the watermark.
    let first = db.run_etl_batch(2).await.unwrap();
    assert_eq!(first.rows_parsed, 2);
    assert_eq!(first.new_watermark, 2);

    let second = db.run_etl_batch(2).await.unwrap();
    assert_eq!(second.rows_parsed, 1);
    assert_eq!(second.new_watermark, 3);
}
