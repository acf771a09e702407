use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{info, warn};

use pixeltrace_core::record::TrackingRecord;

use crate::enrich;
use crate::state::ForgeState;

/// Accept loop on the edge→forge stream. One drain task per connection;
/// the listener exits on the shutdown signal and closes the socket path.
pub async fn run_listener(state: Arc<ForgeState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let path = state.config.pipe_name.clone();
    if let Some(parent) = Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    // A stale socket file from an unclean exit blocks bind.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(path = %path, "pipe listener accepting");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            Arc::clone(&state),
                            stream,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "pipe accept failed"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    info!("pipe listener stopped");
    Ok(())
}

/// Read one connection line by line. A malformed line is logged and
/// counted, never fatal — the stream continues with the next line.
async fn handle_connection(
    state: Arc<ForgeState>,
    stream: UnixStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let Some(mut rec) = decode_line(&state, &line) else {
                    continue;
                };
                enrich::apply_heavy(&state, &mut rec);
                if state.bulk_tx.send(rec).await.is_err() {
                    // Writer gone; nothing more to do on this connection.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "pipe read failed; closing connection");
                break;
            }
        }
    }
}

/// Validate one wire line as a `TrackingRecord`.
pub fn decode_line(state: &ForgeState, line: &str) -> Option<TrackingRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<TrackingRecord>(trimmed) {
        Ok(rec) => {
            state.records_received.fetch_add(1, Ordering::Relaxed);
            Some(rec)
        }
        Err(e) => {
            state.malformed_lines.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "malformed pipe line dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_lines_count_but_do_not_kill() {
        let state = ForgeState::for_tests().await;
        assert!(decode_line(&state, "not json at all").is_none());
        assert!(decode_line(&state, "{\"partial\":").is_none());
        assert!(decode_line(&state, "").is_none());
        assert_eq!(state.malformed_lines.load(Ordering::Relaxed), 2);

        let good = r#"{"ReceivedAt":"2026-05-10T12:00:00.000Z","CompanyID":"1",
            "PiXLID":"2","IPAddress":"203.0.113.9","RequestPath":"/1/2_SMART.GIF",
            "QueryString":"sw=1920","HeadersJson":"{}","UserAgent":"UA","Referer":""}"#
            .replace('\n', "");
        let rec = decode_line(&state, &good).unwrap();
        assert_eq!(rec.company_id, "1");
        assert_eq!(state.records_received.load(Ordering::Relaxed), 1);
    }
}
