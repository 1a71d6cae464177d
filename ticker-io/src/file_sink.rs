use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ticker_core::metrics::BYTES_WRITTEN;
use ticker_core::{Result, SinkTarget};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{info, warn};

/// Bucket directory name for a processing time, one bucket per hour.
pub fn bucket_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d--%H").to_string()
}

struct ActiveFile {
    writer: BufWriter<fs::File>,
    path: PathBuf,
    bucket: String,
    rows: usize,
    opened: Instant,
}

/// Appends JSON lines under `<base>/<yyyy-MM-dd--HH>/part-<lane>-<n>.jsonl`.
///
/// Each lane owns its own part files, so lanes never share a writer. A part
/// file is rolled when the hour bucket changes or when it reaches `max_rows`
/// or `max_age`.
pub struct FileTarget {
    base: PathBuf,
    lane: usize,
    max_rows: usize,
    max_age: Duration,
    run_id: i64,
    sequence: u64,
    active: Option<ActiveFile>,
}

impl FileTarget {
    pub fn new(base: impl Into<PathBuf>, lane: usize, max_rows: usize, max_age: Duration) -> Self {
        Self {
            base: base.into(),
            lane,
            max_rows: max_rows.max(1),
            max_age,
            // distinguishes part files of successive runs sharing a bucket
            run_id: Utc::now().timestamp_millis(),
            sequence: 0,
            active: None,
        }
    }

    /// Path of the part file currently open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    fn needs_roll(&self, bucket: &str) -> bool {
        match &self.active {
            None => true,
            Some(a) => a.bucket != bucket || a.rows >= self.max_rows || a.opened.elapsed() >= self.max_age,
        }
    }

    async fn roll(&mut self, bucket: &str) -> Result<()> {
        if let Some(mut old) = self.active.take() {
            old.writer.flush().await?;
            info!(lane = self.lane, path = %old.path.display(), rows = old.rows, "part file closed");
        }
        let dir = self.base.join(bucket);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("part-{}-{}-{}.jsonl", self.lane, self.run_id, self.sequence));
        self.sequence += 1;
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        self.active = Some(ActiveFile {
            writer: BufWriter::new(file),
            path,
            bucket: bucket.to_string(),
            rows: 0,
            opened: Instant::now(),
        });
        Ok(())
    }

    async fn append(&mut self, batch: &[Vec<u8>]) -> Result<u64> {
        let bucket = bucket_for(Utc::now());
        let mut bytes = 0u64;
        for line in batch {
            if self.needs_roll(&bucket) {
                self.roll(&bucket).await?;
            }
            if let Some(active) = self.active.as_mut() {
                active.writer.write_all(line).await?;
                active.writer.write_all(b"\n").await?;
                active.rows += 1;
                bytes += line.len() as u64 + 1;
            }
        }
        Ok(bytes)
    }

    /// A failed write may leave a torn line behind; the retry goes to a new part.
    fn abandon(&mut self) {
        if let Some(old) = self.active.take() {
            warn!(lane = self.lane, path = %old.path.display(), rows = old.rows, "part file abandoned after a failed write");
        }
    }
}

#[async_trait]
impl SinkTarget for FileTarget {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&mut self, batch: &[Vec<u8>]) -> Result<()> {
        match self.append(batch).await {
            Ok(bytes) => {
                BYTES_WRITTEN.with_label_values(&["file"]).inc_by(bytes);
                Ok(())
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if let Err(e) = active.writer.flush().await {
            self.abandon();
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tmp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("ticker_io_test_{}_{}", name, nanos));
        p
    }

    fn lines(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("{{\"n\":{i}}}").into_bytes()).collect()
    }

    #[test]
    fn hourly_bucket_names() {
        let at = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        assert_eq!(bucket_for(at), "2023-11-14--22");
    }

    #[tokio::test]
    async fn appends_json_lines_into_bucket() {
        let dir = tmp_dir("append");
        let mut t = FileTarget::new(&dir, 1, 100, Duration::from_secs(900));
        t.write(&lines(3)).await.unwrap();
        t.flush().await.unwrap();
        let path = t.current_path().unwrap().to_path_buf();
        assert!(path.starts_with(&dir));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("part-1-"), "{name}");
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.lines().next().unwrap(), "{\"n\":0}");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rolls_after_max_rows() {
        let dir = tmp_dir("roll");
        let mut t = FileTarget::new(&dir, 0, 2, Duration::from_secs(900));
        t.write(&lines(5)).await.unwrap();
        t.flush().await.unwrap();
        let bucket = t.current_path().unwrap().parent().unwrap().to_path_buf();
        let mut total = 0;
        let mut files = 0;
        let mut entries = tokio::fs::read_dir(&bucket).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            files += 1;
            total += tokio::fs::read_to_string(e.path()).await.unwrap().lines().count();
        }
        assert_eq!(files, 3);
        assert_eq!(total, 5);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_write_retries_into_a_fresh_part() {
        let dir = tmp_dir("torn");
        let bucket = bucket_for(Utc::now());
        std::fs::create_dir_all(dir.join(&bucket)).unwrap();
        let broken = dir.join(&bucket).join("broken.jsonl");
        std::fs::write(&broken, b"").unwrap();

        let mut t = FileTarget::new(&dir, 0, 100, Duration::from_secs(900));
        // read-only handle: every write to it fails
        let file = fs::File::open(&broken).await.unwrap();
        t.active = Some(ActiveFile {
            writer: BufWriter::new(file),
            path: broken.clone(),
            bucket,
            rows: 0,
            opened: Instant::now(),
        });

        let mut batch = lines(2);
        batch.push(vec![b'x'; 64 * 1024]);
        let first = match t.write(&batch).await {
            Ok(()) => t.flush().await,
            Err(e) => Err(e),
        };
        assert!(first.is_err());
        assert!(t.current_path().is_none());

        t.write(&lines(2)).await.unwrap();
        t.flush().await.unwrap();
        let path = t.current_path().unwrap().to_path_buf();
        assert_ne!(path, broken);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "{\"n\":0}\n{\"n\":1}\n");
        let _ = std::fs::remove_dir_all(dir);
    }
}
