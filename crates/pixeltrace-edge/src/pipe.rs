use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::UnixStream;
use tracing::{info, warn};

/// Reconnect back-off cap.
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_START: Duration = Duration::from_millis(100);

/// Writer side of the edge→forge stream: a unix socket carrying one JSON
/// record per line. Reconnection is this side's responsibility, with
/// exponential back-off capped at five seconds.
pub struct PipeClient {
    path: String,
    stream: Option<BufWriter<UnixStream>>,
    backoff: Duration,
}

impl PipeClient {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            stream: None,
            backoff: BACKOFF_START,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Try to connect once. Failure leaves the client disconnected and
    /// grows the back-off; the caller decides when to retry.
    pub async fn try_connect(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        match UnixStream::connect(&self.path).await {
            Ok(stream) => {
                info!(path = %self.path, "pipe connected");
                self.stream = Some(BufWriter::new(stream));
                self.backoff = BACKOFF_START;
                true
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "pipe connect failed");
                false
            }
        }
    }

    /// Back-off delay to sleep after a failed connect, with jitter so a
    /// restarting forge is not hammered in lockstep.
    pub fn next_backoff(&mut self) -> Duration {
        let current = self.backoff;
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        let jitter_ms = rand::thread_rng().gen_range(0..=current.as_millis() as u64 / 4);
        current + Duration::from_millis(jitter_ms)
    }

    /// Reset back-off and drop the connection so the next write reconnects.
    /// Wired to the circuit-reset control endpoint.
    pub fn reset(&mut self) {
        self.stream = None;
        self.backoff = BACKOFF_START;
    }

    /// Write one record line. The line is acknowledged (and the caller may
    /// discard it) only once the flush succeeds; any error drops the
    /// connection so the caller fails over.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            anyhow::bail!("pipe not connected");
        };
        let outcome: Result<()> = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
            Ok(())
        }
        .await;
        if outcome.is_err() {
            self.stream = None;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn writes_line_delimited_records() {
        let path = std::env::temp_dir().join(format!("pt-pipe-test-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = PipeClient::new(&path.to_string_lossy());
        assert!(client.try_connect().await);

        let (server, _) = listener.accept().await.unwrap();
        client.write_line("{\"CompanyID\":\"1\"}").await.unwrap();

        let mut lines = BufReader::new(server).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "{\"CompanyID\":\"1\"}");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn connect_failure_is_not_fatal() {
        let mut client = PipeClient::new("/nonexistent/pixeltrace.sock");
        assert!(!client.try_connect().await);
        assert!(!client.is_connected());
        let first = client.next_backoff();
        let second = client.next_backoff();
        assert!(second >= first);
        assert!(client.next_backoff() <= BACKOFF_CAP + BACKOFF_CAP / 4);
    }
}
