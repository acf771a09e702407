use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::state::ForgeState;

/// Reputation refresh runs every Nth pipeline tick.
const REPUTATION_EVERY: u64 = 20;

/// One pipeline iteration: ETL parse, identity resolution, scoring. Split
/// out of the loop so tests can drive it directly.
pub async fn process_once(state: &Arc<ForgeState>) -> anyhow::Result<(usize, usize, usize)> {
    let etl = state.store.run_etl_batch(state.config.etl_batch_rows).await?;
    let identity = state
        .store
        .run_identity_batch(state.config.etl_batch_rows)
        .await?;
    let scoring = state
        .store
        .run_scoring_batch(state.config.etl_batch_rows)
        .await?;
    Ok((
        etl.rows_parsed,
        identity.visits_matched,
        scoring.visits_scored,
    ))
}

/// Periodic ETL / identity / scoring driver, one task per forge process.
/// Iteration failures are logged and the next tick retries — the
/// watermark guarantees nothing is skipped.
pub async fn run_pipeline_loop(state: Arc<ForgeState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.etl_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        interval_s = state.config.etl_interval_seconds,
        "pipeline scheduler started"
    );
    let mut tick = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        tick += 1;
        match process_once(&state).await {
            Ok((parsed, matched, scored)) => {
                if parsed + matched + scored > 0 {
                    info!(parsed, matched, scored, "pipeline iteration complete");
                }
            }
            Err(e) => error!(error = %e, "pipeline iteration failed"),
        }
        if tick % REPUTATION_EVERY == 0 {
            if let Err(e) = state.store.refresh_subnet_reputation().await {
                error!(error = %e, "subnet reputation refresh failed");
            }
        }
    }
    info!("pipeline scheduler stopped");
}
