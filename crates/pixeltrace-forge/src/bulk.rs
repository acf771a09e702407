use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pixeltrace_core::record::TrackingRecord;
use pixeltrace_duckdb::StoreBackend;

use crate::state::ForgeState;

/// Maximum delay before a partial batch is written anyway.
const MAX_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Consecutive failures before the writer escalates to degraded health.
const ESCALATE_AFTER: u32 = 3;
const RETRY_BACKOFF_START: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Drain the bulk queue into the raw table in batches. Producers block on
/// the bounded channel when the writer falls behind — nothing is dropped
/// at this stage. The loop exits when every sender is gone, after writing
/// whatever remains, so shutdown finishes in-flight batches.
pub async fn run_bulk_writer(state: Arc<ForgeState>, mut rx: mpsc::Receiver<TrackingRecord>) {
    let batch_size = state.config.batch_size.max(1);
    let timeout = state.config.bulk_copy_timeout();

    loop {
        let Some(first) = rx.recv().await else {
            break;
        };
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);

        let deadline = tokio::time::sleep(MAX_BATCH_DELAY);
        tokio::pin!(deadline);
        while batch.len() < batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                more = rx.recv() => match more {
                    Some(rec) => batch.push(rec),
                    None => break,
                },
            }
        }

        write_with_retry(&state, &state.store, &batch, timeout).await;
    }
    info!("bulk writer stopped");
}

/// Insert one batch, retrying with exponential back-off until it lands. A
/// failed attempt rolls the whole batch back (single transaction), so the
/// retry re-sends identical rows. After [`ESCALATE_AFTER`] consecutive
/// failures the writer escalates to degraded health and keeps trying
/// best-effort.
pub async fn write_with_retry(
    state: &ForgeState,
    store: &StoreBackend,
    batch: &[TrackingRecord],
    per_batch_timeout: Duration,
) {
    let mut consecutive = 0u32;
    let mut backoff = RETRY_BACKOFF_START;
    loop {
        let attempt = tokio::time::timeout(per_batch_timeout, store.insert_raw_batch(batch)).await;
        match attempt {
            Ok(Ok(rows)) => {
                if consecutive > 0 {
                    info!(rows, "bulk insert recovered");
                }
                state.degraded.store(false, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => {
                consecutive += 1;
                warn!(attempt = consecutive, error = %e, "bulk insert failed; batch re-enqueued");
            }
            Err(_) => {
                consecutive += 1;
                warn!(
                    attempt = consecutive,
                    timeout_s = per_batch_timeout.as_secs(),
                    "bulk insert timed out; batch re-enqueued"
                );
            }
        }
        if consecutive == ESCALATE_AFTER {
            error!(
                rows = batch.len(),
                "bulk insert failed {ESCALATE_AFTER} times consecutively; degraded"
            );
            state.degraded.store(true, Ordering::Relaxed);
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
    }
}
