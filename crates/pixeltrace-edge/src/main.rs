use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Timelike, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use pixeltrace_core::config::Config;
use pixeltrace_duckdb::{GeoStore, StoreBackend};
use pixeltrace_edge::{
    app, dispatch::{self, Dispatcher}, failover::FailoverLog, geocache::GeoCache,
    pipe::PipeClient, state::AppState,
};

/// IPs pre-warmed into the hot geo tier at startup.
const PREWARM_TOP_N: usize = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pixeltrace=info".parse()?),
        )
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    if let Some(parent) = std::path::Path::new(&cfg.geo_db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let geo_store = Arc::new(GeoStore::open(&cfg.geo_db_path)?);
    let geo_cache = GeoCache::new(Arc::clone(&geo_store));

    prewarm_geo_cache(&cfg, &geo_cache).await;

    let dispatcher = Arc::new(Dispatcher::new(cfg.queue_capacity));
    let state = Arc::new(AppState::new(
        cfg.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&geo_cache),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Single drain task: queue → pipe, failover on trouble.
    let drain = tokio::spawn(dispatch::run_drain(
        Arc::clone(&dispatcher),
        PipeClient::new(&cfg.pipe_name),
        FailoverLog::new(&cfg.failover_dir),
        shutdown_rx.clone(),
        cfg.shutdown_timeout(),
    ));

    // Daily geo refresh at the configured UTC hour.
    {
        let geo_store = Arc::clone(&geo_store);
        let geo_cache = Arc::clone(&geo_cache);
        let hour = cfg.ipapi_sync_hour_utc;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(until_next_utc_hour(hour)).await;
                match geo_store.sync_from_upstream().await {
                    Ok(ranges) => {
                        info!(ranges, "daily geo sync complete; clearing hot tier");
                        geo_cache.clear_hot();
                    }
                    Err(e) => warn!(error = %e, "daily geo sync failed"),
                }
            }
        });
    }

    // Loopback control surface.
    let internal_addr = format!("127.0.0.1:{}", cfg.internal_port);
    let internal = axum::serve(
        tokio::net::TcpListener::bind(&internal_addr).await?,
        app::build_internal_app(Arc::clone(&state))
            .into_make_service_with_connect_info::<std::net::SocketAddr>(),
    );
    let mut internal_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let server = internal.with_graceful_shutdown(async move {
            let _ = internal_shutdown.changed().await;
        });
        if let Err(e) = server.await {
            warn!(error = %e, "internal server exited with error");
        }
    });

    // Public ingest surface.
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(port = cfg.port, internal_port = cfg.internal_port, "edge listening on {addr}");

    let mut serve_shutdown = shutdown_rx.clone();
    let server = axum::serve(
        listener,
        app::build_ingest_app(Arc::clone(&state))
            .into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_shutdown.changed().await;
    });

    let serving = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received; draining dispatcher");
    let _ = shutdown_tx.send(true);

    let _ = serving.await;
    let _ = drain.await;
    info!("edge stopped");
    Ok(())
}

/// Best-effort pre-warm: read the top-N most-hit IPs from the main store's
/// IP dimension and schedule geo fills for them. The forge usually holds
/// the writer lock on that file, in which case pre-warm is skipped.
async fn prewarm_geo_cache(cfg: &Config, cache: &GeoCache) {
    let store = match StoreBackend::open_read_only(&cfg.db_path) {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "pre-warm skipped; main store unavailable");
            return;
        }
    };
    match store.top_hot_ips(PREWARM_TOP_N).await {
        Ok(ips) => {
            let count = ips.len();
            for ip in ips {
                // get() on a cold cache schedules the background fill.
                let _ = cache.get(&ip);
            }
            info!(count, "geo cache pre-warm scheduled");
        }
        Err(e) => warn!(error = %e, "pre-warm query failed"),
    }
}

/// Duration until the next occurrence of `hour:00` UTC.
fn until_next_utc_hour(hour: u32) -> Duration {
    let now = Utc::now();
    let seconds_today = i64::from(now.num_seconds_from_midnight());
    let target = i64::from(hour) * 3600;
    let until = if seconds_today < target {
        target - seconds_today
    } else {
        86_400 - seconds_today + target
    };
    Duration::from_secs(until.max(1) as u64)
}
