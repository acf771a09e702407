use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Rotate when the current file reaches this size.
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
/// Rotate when the current file reaches this age.
const ROTATE_AGE: Duration = Duration::from_secs(60);

/// Append-only durable log for records that could not be delivered over
/// the pipe. One JSON line per record; file names are time-sortable so the
/// forge replays them in write order. A single writer owns the current
/// file; the replayer takes ownership of closed files by rename.
pub struct FailoverLog {
    dir: PathBuf,
    current: Option<CurrentFile>,
    seq: u64,
}

struct CurrentFile {
    file: File,
    path: PathBuf,
    bytes: u64,
    opened_at: Instant,
}

impl FailoverLog {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: PathBuf::from(dir),
            current: None,
            seq: 0,
        }
    }

    /// Append one record line, rotating by size or age first. Errors
    /// propagate — a failover write failure is the last line of defense
    /// and the caller counts it as a loss.
    pub async fn append(&mut self, line: &str) -> Result<()> {
        self.rotate_if_needed().await?;
        if self.current.is_none() {
            self.open_new().await?;
        }
        let Some(current) = self.current.as_mut() else {
            anyhow::bail!("failover file unavailable");
        };
        current.file.write_all(line.as_bytes()).await?;
        current.file.write_all(b"\n").await?;
        current.file.flush().await?;
        current.bytes += line.len() as u64 + 1;
        Ok(())
    }

    /// Close the current file so the replayer may claim it.
    pub async fn close_current(&mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            drop(current.file);
            info!(path = %current.path.display(), bytes = current.bytes, "failover file closed");
        }
        Ok(())
    }

    async fn rotate_if_needed(&mut self) -> Result<()> {
        let rotate = self
            .current
            .as_ref()
            .map(|c| c.bytes >= ROTATE_BYTES || c.opened_at.elapsed() >= ROTATE_AGE)
            .unwrap_or(false);
        if rotate {
            self.close_current().await?;
        }
        Ok(())
    }

    async fn open_new(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.seq += 1;
        let path = self
            .dir
            .join(format!("failover-{}-{:04}.jsonl", Utc::now().timestamp_millis(), self.seq));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "failover file opened");
        self.current = Some(CurrentFile {
            file,
            path,
            bytes: 0,
            opened_at: Instant::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_writes_one_line_per_record() {
        let dir = std::env::temp_dir().join(format!("pt-failover-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut log = FailoverLog::new(&dir.to_string_lossy());
        log.append("{\"a\":1}").await.unwrap();
        log.append("{\"b\":2}").await.unwrap();
        log.close_current().await.unwrap();

        let mut entries: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(&entries[0]).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn file_names_are_time_sortable() {
        let dir = std::env::temp_dir().join(format!("pt-failover-seq-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut log = FailoverLog::new(&dir.to_string_lossy());
        log.append("x").await.unwrap();
        log.close_current().await.unwrap();
        log.append("y").await.unwrap();
        log.close_current().await.unwrap();

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0] < names[1]);
        let _ = std::fs::remove_dir_all(&dir);
    }

}
