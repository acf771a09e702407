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
async fn email_match_resolves_against_consumers() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.seed_consumer(
        1,
        None,
        Some("alice@test.com"),
        None,
        None,
        None,
        "IND-1",
        "ADDR-1",
    )
    .await
    .unwrap();

    db.insert_raw_batch(&[record(
        "12800",
        "100",
        "203.0.113.9",
        "_cp_email=alice%40test.com&_srv_ipClass=public",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let outcome = db.run_identity_batch(10_000).await.unwrap();
    assert_eq!(outcome.visits_examined, 1);
    assert_eq!(outcome.visits_matched, 1);

    let (mtype, key, ind): (String, String, String) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT match_type, match_key, individual_key FROM matches",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(mtype, "email");
    assert_eq!(key, "alice@test.com");
    assert_eq!(ind, "IND-1");
}

#[tokio::test]
async fn repeat_match_updates_hit_count_not_row_count() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.seed_consumer(1, None, Some("bob@test.com"), None, None, None, "IND-2", "ADDR-2")
        .await
        .unwrap();

    for _ in 0..3 {
        db.insert_raw_batch(&[record("5", "9", "203.0.113.4", "_cp_email=bob%40test.com")])
            .await
            .unwrap();
    }
    db.run_etl_batch(10_000).await.unwrap();
    db.run_identity_batch(10_000).await.unwrap();

    let (rows, hits): (i64, i64) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*), SUM(hit_count) FROM matches",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(rows, 1, "one natural key, one match row");
    assert_eq!(hits, 3);
}

#[tokio::test]
async fn direct_ip_match_requires_residential() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.seed_consumer(1, None, None, Some("203.0.113.50"), None, None, "IND-3", "ADDR-3")
        .await
        .unwrap();
    db.seed_consumer(2, None, None, Some("198.51.100.60"), None, None, "IND-4", "ADDR-4")
        .await
        .unwrap();

    // Residential (public, no datacenter flag): matches.
    db.insert_raw_batch(&[record("1", "1", "203.0.113.50", "_srv_ipClass=public&x=1")])
        .await
        .unwrap();
    // Datacenter-flagged: must not match by IP.
    db.insert_raw_batch(&[record(
        "1",
        "1",
        "198.51.100.60",
        "_srv_ipClass=public&_srv_dcName=aws",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let outcome = db.run_identity_batch(10_000).await.unwrap();
    assert_eq!(outcome.visits_matched, 1);

    let mtype: String = db
        .with_conn(|conn| Ok(conn.query_row("SELECT match_type FROM matches", [], |r| r.get(0))?))
        .await
        .unwrap();
    assert_eq!(mtype, "ip");
}

#[tokio::test]
async fn geo_proximity_matches_within_threshold() {
    let db = StoreBackend::open_in_memory().unwrap();
    // Consumer at (40.0000, -74.0000); visit coordinates ~550 m north.
    db.seed_consumer(
        1,
        None,
        None,
        None,
        Some(40.0),
        Some(-74.0),
        "IND-5",
        "ADDR-5",
    )
    .await
    .unwrap();

    db.insert_raw_batch(&[record(
        "1",
        "1",
        "203.0.113.70",
        "_srv_ipClass=public&_srv_mmLat=40.005&_srv_mmLon=-74.0",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let outcome = db.run_identity_batch(10_000).await.unwrap();
    assert_eq!(outcome.visits_matched, 1);

    let (mtype, addr): (String, String) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT match_type, address_key FROM matches",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(mtype, "geo");
    assert_eq!(addr, "ADDR-5");
}

#[tokio::test]
async fn scoring_materializes_clamped_scores_and_summary() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[record(
        "12800",
        "100",
        "203.0.113.9",
        "mm=120&me=3.5&mscv=0.8&mtcv=0.9&dw=45000&sd=40\
         &_srv_sessionId=s-1&_srv_sessionHit=3&_srv_leadScore=80&_srv_culturalScore=100",
    )])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let outcome = db.run_scoring_batch(10_000).await.unwrap();
    assert_eq!(outcome.visits_scored, 1);
    assert_eq!(outcome.periods_recomputed, 1);

    let (mouse, session, composite): (i32, i32, i32) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT mouse_score, session_quality, composite_score FROM visits WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?)
        })
        .await
        .unwrap();
    assert!((0..=100).contains(&mouse), "mouse {mouse}");
    assert!((0..=100).contains(&session), "session {session}");
    assert!((0..=100).contains(&composite), "composite {composite}");
    // Rich human-looking signals: all three land high.
    assert!(mouse >= 90, "mouse {mouse}");
    assert!(session >= 80, "session {session}");
    assert!(composite >= 70, "composite {composite}");

    // Daily, weekly, and monthly summary rows exist for the company.
    let periods: i64 = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM customer_summary WHERE company_id = 12800",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(periods, 3);
}

#[tokio::test]
async fn scoring_zero_mouse_bucket_means_zero_mouse_score() {
    let db = StoreBackend::open_in_memory().unwrap();
    // No mouse telemetry at all: the move-count bucket is absent.
    db.insert_raw_batch(&[record("3", "4", "203.0.113.11", "sw=1920")])
        .await
        .unwrap();
    db.run_etl_batch(10_000).await.unwrap();
    db.run_scoring_batch(10_000).await.unwrap();

    let mouse: i32 = db
        .with_conn(|conn| {
            Ok(conn.query_row("SELECT mouse_score FROM visits WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert_eq!(mouse, 0);
}

#[tokio::test]
async fn subnet_reputation_aggregates_by_slash24() {
    let db = StoreBackend::open_in_memory().unwrap();
    db.insert_raw_batch(&[
        record("1", "1", "203.0.113.10", "_srv_dcName=aws&a=1"),
        record("1", "1", "203.0.113.20", "b=2"),
        record("1", "1", "198.51.100.9", "c=3"),
    ])
    .await
    .unwrap();
    db.run_etl_batch(10_000).await.unwrap();

    let subnets = db.refresh_subnet_reputation().await.unwrap();
    assert_eq!(subnets, 2);

    let (ips, dc_ratio): (i64, f64) = db
        .with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT unique_ips, datacenter_ratio FROM subnet_reputation \
                 WHERE subnet24 = '203.0.113.0/24'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(ips, 2);
    assert!(dc_ratio > 0.0 && dc_ratio < 1.0);
}
