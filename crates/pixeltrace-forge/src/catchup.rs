use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use pixeltrace_core::record::TrackingRecord;

use crate::state::ForgeState;

/// Scan cadence for the failover directory.
const SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum file age before a failover file is claimed. Twice the edge's
/// age rotation, so a file the writer still owns is never touched.
const CLAIM_AGE: Duration = Duration::from_secs(120);
/// Rows per insert during replay.
const REPLAY_BATCH: usize = 500;

/// Failover catch-up: replay closed `.jsonl` files from the durable
/// directory straight into the raw table. Ownership is taken by renaming
/// the file to `.replaying` before the first read; the `.done` sidecar is
/// written only after every line has been committed, then the data file is
/// removed. Replay order follows the time-sortable file names; ordering
/// relative to live pipe traffic is not preserved (and nothing downstream
/// relies on it).
pub async fn run_catchup(state: Arc<ForgeState>, mut shutdown: watch::Receiver<bool>) {
    let dir = PathBuf::from(&state.config.failover_dir);
    let mut interval = tokio::time::interval(SCAN_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        for path in claimable_files(&dir) {
            if let Err(e) = replay_file(&state, &path).await {
                warn!(path = %path.display(), error = %e, "failover replay failed");
            }
        }
    }
}

/// Closed failover files eligible for claim, oldest first.
pub fn claimable_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|e| e == "jsonl").unwrap_or(false))
        .filter(|path| !done_marker(path).exists())
        .filter(|path| {
            std::fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map(|modified| {
                    modified
                        .elapsed()
                        .map(|age| age >= CLAIM_AGE)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn done_marker(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.done", path.display()))
}

/// Replay one file. Line order within the file is preserved; each batch is
/// one raw-table transaction.
pub async fn replay_file(state: &ForgeState, path: &Path) -> Result<()> {
    // Exclusive ownership by atomic rename; a second replayer loses the
    // race and skips.
    let claimed = PathBuf::from(format!("{}.replaying", path.display()));
    if std::fs::rename(path, &claimed).is_err() {
        return Ok(());
    }

    let content = tokio::fs::read_to_string(&claimed).await?;
    let mut batch: Vec<TrackingRecord> = Vec::with_capacity(REPLAY_BATCH);
    let mut replayed = 0usize;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<TrackingRecord>(trimmed) {
            Ok(rec) => {
                batch.push(rec);
                if batch.len() >= REPLAY_BATCH {
                    replayed += state.store.insert_raw_batch(&batch).await?;
                    batch.clear();
                }
            }
            Err(e) => {
                state.malformed_lines.fetch_add(1, Ordering::Relaxed);
                warn!(path = %claimed.display(), error = %e, "malformed failover line dropped");
            }
        }
    }
    if !batch.is_empty() {
        replayed += state.store.insert_raw_batch(&batch).await?;
    }

    // Every line acknowledged: mark done, then remove the data file.
    tokio::fs::write(done_marker(path), replayed.to_string()).await?;
    tokio::fs::remove_file(&claimed).await?;
    info!(path = %path.display(), rows = replayed, "failover file replayed");
    Ok(())
}
