use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use pixeltrace_core::config::Config;
use pixeltrace_core::record::TrackingRecord;
use pixeltrace_duckdb::StoreBackend;
use pixeltrace_forge::{bulk, listener, state::ForgeState, tasks};

fn wire_line(company: &str, pixel: &str, ip: &str, query: &str) -> String {
    let rec = TrackingRecord {
        received_at: chrono::Utc::now(),
        company_id: company.to_string(),
        pixl_id: pixel.to_string(),
        ip_address: ip.to_string(),
        request_path: format!("/{company}/{pixel}_SMART.GIF"),
        query_string: query.to_string(),
        headers_json: "{}".to_string(),
        user_agent: "Mozilla/5.0".to_string(),
        referer: String::new(),
    };
    rec.to_wire_line().unwrap()
}

async fn forge_fixture(pipe_path: &str) -> (Arc<ForgeState>, watch::Sender<bool>) {
    let mut cfg = Config::from_env().unwrap();
    cfg.pipe_name = pipe_path.to_string();

    let store = Arc::new(StoreBackend::open_in_memory().unwrap());
    let (bulk_tx, bulk_rx) = mpsc::channel(64);
    let state = Arc::new(ForgeState::new(cfg, store, bulk_tx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(bulk::run_bulk_writer(Arc::clone(&state), bulk_rx));
    tokio::spawn(listener::run_listener(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    // Give the listener a beat to bind the socket.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (state, shutdown_tx)
}

async fn raw_count(state: &ForgeState) -> i64 {
    state
        .store
        .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM raw_hits", [], |r| r.get(0))?))
        .await
        .unwrap()
}

#[tokio::test]
async fn records_flow_from_pipe_to_raw_with_heavy_enrichment() {
    let pipe = std::env::temp_dir().join(format!("pt-forge-e2e-{}.sock", std::process::id()));
    let pipe_str = pipe.to_string_lossy().into_owned();
    let (state, shutdown) = forge_fixture(&pipe_str).await;

    let mut conn = UnixStream::connect(&pipe_str).await.unwrap();
    let line = wire_line(
        "12800",
        "100",
        "203.0.113.9",
        "sw=1920&sh=1080&cv=abc&mm=40&_srv_ipClass=public&_srv_hitType=modern",
    );
    conn.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    conn.write_all(b"this is not json\n").await.unwrap();
    conn.flush().await.unwrap();

    // Wait for the record to travel listener → enrichment → bulk writer.
    for _ in 0..100 {
        if raw_count(&state).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(raw_count(&state).await, 1);
    assert_eq!(
        state
            .malformed_lines
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // The stored query string carries the heavy-tier keys.
    let query: String = state
        .store
        .with_conn(|conn| {
            Ok(conn.query_row("SELECT query_string FROM raw_hits", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert!(query.contains("_srv_sessionId="));
    assert!(query.contains("_srv_leadScore="));
    assert!(query.contains("_srv_affluenceTier="));

    // And the ETL stage turns it into a parsed row + visit.
    let (parsed, _matched, scored) = tasks::process_once(&state).await.unwrap();
    assert_eq!(parsed, 1);
    assert_eq!(scored, 1);
    let session: Option<String> = state
        .store
        .with_conn(|conn| {
            Ok(conn.query_row("SELECT session_id FROM visits WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
        .unwrap();
    assert!(session.is_some(), "session id must flow through the ETL");

    let _ = shutdown.send(true);
    let _ = std::fs::remove_file(&pipe);
}

#[tokio::test]
async fn stream_survives_malformed_flood() {
    let pipe = std::env::temp_dir().join(format!("pt-forge-junk-{}.sock", std::process::id()));
    let pipe_str = pipe.to_string_lossy().into_owned();
    let (state, shutdown) = forge_fixture(&pipe_str).await;

    let mut conn = UnixStream::connect(&pipe_str).await.unwrap();
    for _ in 0..10 {
        conn.write_all(b"{broken\n").await.unwrap();
    }
    let line = wire_line("7", "8", "198.51.100.2", "a=1");
    conn.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    conn.flush().await.unwrap();

    for _ in 0..100 {
        if raw_count(&state).await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(raw_count(&state).await, 1, "good record survives the junk");

    let _ = shutdown.send(true);
    let _ = std::fs::remove_file(&pipe);
}
