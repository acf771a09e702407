use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::info;

use pixeltrace_core::config::Config;
use pixeltrace_duckdb::StoreBackend;
use pixeltrace_forge::{bulk, catchup, listener, state::ForgeState, tasks};

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

    if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(StoreBackend::open(&cfg.db_path, &cfg.store_memory_limit)?);

    // Bulk queue: bounded at four batches so the listener backpressures
    // instead of buffering unboundedly.
    let (bulk_tx, bulk_rx) = mpsc::channel(cfg.batch_size.max(1) * 4);
    let state = Arc::new(ForgeState::new(cfg.clone(), Arc::clone(&store), bulk_tx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let writer = tokio::spawn(bulk::run_bulk_writer(Arc::clone(&state), bulk_rx));
    let pipeline = tokio::spawn(tasks::run_pipeline_loop(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    let catch_up = tokio::spawn(catchup::run_catchup(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));
    let accept = tokio::spawn(listener::run_listener(
        Arc::clone(&state),
        shutdown_rx.clone(),
    ));

    info!(pipe = %cfg.pipe_name, db = %cfg.db_path, "forge running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received; finishing in-flight work");
    let _ = shutdown_tx.send(true);

    // The listener and its connections stop sending; dropping the state's
    // sender lets the bulk writer drain the queue and exit after the final
    // batch.
    let _ = accept.await;
    let _ = pipeline.await;
    let _ = catch_up.await;
    drop(state);
    let _ = writer.await;
    info!("forge stopped");
    Ok(())
}
