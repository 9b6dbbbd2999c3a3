//! Segmented file store for the recovery log

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use xacoord_common::error::{Error, LogError, Result};
use xacoord_common::metrics;

use crate::record::{decode_frames, encode_frame, LogRecord};
use crate::store::LogStore;

const SEGMENT_SUFFIX: &str = ".log";

fn write_failed(e: std::io::Error) -> Error {
    Error::Log(LogError::WriteFailed(e.to_string()))
}

fn read_failed(e: std::io::Error) -> Error {
    Error::Log(LogError::ReadFailed(e.to_string()))
}

/// Recovery log kept in numbered segment files under one directory
pub struct FileLogStore {
    /// Path to log directory
    path: PathBuf,
    /// Current segment writer (async-safe mutex for holding across .await)
    writer: Mutex<Option<BufWriter<File>>>,
    /// Current segment number
    segment: AtomicU64,
    /// Current offset in segment
    offset: AtomicU64,
    /// Records appended since open
    sequence: AtomicU64,
    /// Segment size that triggers rotation
    max_segment_size: u64,
}

impl FileLogStore {
    /// Open (or create) the log directory and start a fresh segment
    pub async fn open(path: &Path, max_segment_size: u64) -> Result<Self> {
        info!("Opening recovery log at {:?}", path);

        tokio::fs::create_dir_all(path).await?;

        let store = Self {
            path: path.to_path_buf(),
            writer: Mutex::new(None),
            segment: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            max_segment_size,
        };

        store.recover().await?;

        let mut guard = store.writer.lock().await;
        store.open_new_segment(&mut guard).await?;
        drop(guard);

        Ok(store)
    }

    /// List segment files in ascending order
    async fn segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.path).await.map_err(read_failed)?;
        while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(Ok(segment)) = name.strip_suffix(SEGMENT_SUFFIX).map(str::parse::<u64>) {
                    segments.push((segment, entry.path()));
                }
            }
        }

        segments.sort_unstable_by_key(|(segment, _)| *segment);
        Ok(segments)
    }

    /// Drop empty segments and cut a torn tail off the newest one
    async fn recover(&self) -> Result<()> {
        let mut max_segment = 0u64;
        let mut newest: Option<(u64, PathBuf)> = None;

        for (segment, path) in self.segments().await? {
            max_segment = max_segment.max(segment);
            let len = tokio::fs::metadata(&path).await.map_err(read_failed)?.len();
            if len == 0 {
                debug!("Removing empty log segment {:?}", path);
                tokio::fs::remove_file(&path).await?;
            } else {
                newest = Some((segment, path));
            }
        }

        if let Some((segment, path)) = newest {
            let buf = tokio::fs::read(&path).await.map_err(read_failed)?;
            let scan = decode_frames(&buf)?;
            if scan.torn {
                warn!(
                    "Truncating torn tail of log segment {}: {} of {} bytes intact",
                    segment,
                    scan.valid_len,
                    buf.len()
                );
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(scan.valid_len as u64).await.map_err(write_failed)?;
                file.sync_all().await.map_err(write_failed)?;
            }
        }

        self.segment.store(max_segment + 1, Ordering::SeqCst);
        info!("Recovery log opened, starting from segment {}", max_segment + 1);

        Ok(())
    }

    /// Open the segment numbered by `self.segment`
    async fn open_new_segment(&self, writer: &mut Option<BufWriter<File>>) -> Result<()> {
        let segment = self.segment.load(Ordering::SeqCst);
        let path = self.path.join(format!("{segment:020}{SEGMENT_SUFFIX}"));

        debug!("Opening new log segment: {:?}", path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(write_failed)?;

        *writer = Some(BufWriter::new(file));
        self.offset.store(0, Ordering::SeqCst);

        Ok(())
    }

    async fn sync_writer(writer: &mut BufWriter<File>) -> Result<()> {
        writer.flush().await.map_err(write_failed)?;
        writer.get_ref().sync_all().await.map_err(write_failed)
    }

    /// Rotate to a new segment
    async fn rotate(&self, writer: &mut Option<BufWriter<File>>) -> Result<()> {
        if let Some(current) = writer.as_mut() {
            Self::sync_writer(current).await?;
        }
        self.segment.fetch_add(1, Ordering::SeqCst);
        self.open_new_segment(writer).await
    }

    /// Get current segment number
    pub fn current_segment(&self) -> u64 {
        self.segment.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append(&self, record: &LogRecord) -> Result<u64> {
        let frame = encode_frame(record)?;
        let frame_len = frame.len() as u64;

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            return Err(LogError::Closed.into());
        }

        let current_offset = self.offset.load(Ordering::SeqCst);
        if current_offset > 0 && current_offset + frame_len > self.max_segment_size {
            self.rotate(&mut guard).await?;
        }

        let writer = guard.as_mut().ok_or(LogError::Closed)?;
        writer.write_all(&frame).await.map_err(write_failed)?;
        self.offset.fetch_add(frame_len, Ordering::SeqCst);

        metrics::record_log_append(record.kind(), frame_len);
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn force(&self) -> Result<()> {
        let start = Instant::now();

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(LogError::Closed)?;
        Self::sync_writer(writer).await?;

        metrics::record_log_force(start.elapsed().as_secs_f64() * 1_000_000.0);
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LogRecord>> {
        // Hold the writer so no append lands mid-read
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.flush().await.map_err(write_failed)?;
        }

        let segments = self.segments().await?;
        let last = segments.len().saturating_sub(1);
        let mut records = Vec::new();

        for (i, (segment, path)) in segments.iter().enumerate() {
            let buf = tokio::fs::read(path).await.map_err(read_failed)?;
            let scan = decode_frames(&buf)?;
            if scan.torn {
                if i != last {
                    return Err(LogError::Corrupt(format!(
                        "segment {} damaged at offset {}",
                        segment, scan.valid_len
                    ))
                    .into());
                }
                warn!(
                    "Ignoring {} trailing bytes in log segment {}",
                    buf.len() - scan.valid_len,
                    segment
                );
            }
            records.extend(scan.records);
        }

        Ok(records)
    }

    async fn rewrite(&self, records: &[LogRecord]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => Self::sync_writer(writer).await?,
            None => return Err(LogError::Closed.into()),
        }

        let old_segments = self.segments().await?;

        // The compacted segment is synced before any old segment goes away;
        // a crash in between only replays duplicate records.
        self.segment.fetch_add(1, Ordering::SeqCst);
        self.open_new_segment(&mut guard).await?;
        let writer = guard.as_mut().ok_or(LogError::Closed)?;

        let mut written = 0u64;
        for record in records {
            let frame = encode_frame(record)?;
            writer.write_all(&frame).await.map_err(write_failed)?;
            written += frame.len() as u64;
        }
        Self::sync_writer(writer).await?;
        self.offset.store(written, Ordering::SeqCst);

        for (segment, path) in old_segments {
            debug!("Removing compacted log segment {}", segment);
            tokio::fs::remove_file(&path).await.map_err(write_failed)?;
        }

        info!(
            "Recovery log rewritten: {} records, {} bytes in segment {}",
            records.len(),
            written,
            self.current_segment()
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            Self::sync_writer(&mut writer).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CompletedRecord, PartnerRecord};

    fn partner(id: i32) -> LogRecord {
        LogRecord::Partner(PartnerRecord {
            recovery_id: id,
            factory: "jdbc".to_string(),
            info: vec![id as u8; 32],
            priority: 0,
            written_at: 0,
        })
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
            assert_eq!(store.append(&partner(1)).await.unwrap(), 1);
            assert_eq!(store.append(&partner(2)).await.unwrap(), 2);
            store.force().await.unwrap();
        }

        let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
        let records = store.read_all().await.unwrap();
        assert_eq!(records, vec![partner(1), partner(2)]);
    }

    #[tokio::test]
    async fn test_torn_tail_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let segment_path;
        {
            let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
            segment_path = dir.path().join(format!("{:020}.log", store.current_segment()));
            store.append(&partner(1)).await.unwrap();
            store.force().await.unwrap();
        }

        // Half-written frame after the intact one
        let mut bytes = tokio::fs::read(&segment_path).await.unwrap();
        let intact = bytes.len();
        bytes.extend_from_slice(&encode_frame(&partner(2)).unwrap()[..10]);
        tokio::fs::write(&segment_path, &bytes).await.unwrap();

        let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
        assert_eq!(
            tokio::fs::metadata(&segment_path).await.unwrap().len(),
            intact as u64
        );
        assert_eq!(store.read_all().await.unwrap(), vec![partner(1)]);
    }

    #[tokio::test]
    async fn test_rotation_and_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path(), 4096).await.unwrap();
        let first = store.current_segment();

        for id in 1..=200 {
            store.append(&partner(id)).await.unwrap();
        }
        store.force().await.unwrap();
        assert!(store.current_segment() > first);
        assert_eq!(store.read_all().await.unwrap().len(), 200);

        let kept = vec![partner(7), LogRecord::Completed(CompletedRecord {
            gtrid: vec![9],
            completed_at: 5,
        })];
        store.rewrite(&kept).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), kept);
        assert_eq!(store.segments().await.unwrap().len(), 1);

        store.append(&partner(8)).await.unwrap();
        store.force().await.unwrap();
        assert_eq!(store.read_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_damage_in_older_segment_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let old_path;
        {
            let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
            old_path = dir.path().join(format!("{:020}.log", store.current_segment()));
            store.append(&partner(1)).await.unwrap();
            store.force().await.unwrap();
        }

        let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
        store.append(&partner(2)).await.unwrap();
        store.force().await.unwrap();

        let mut bytes = tokio::fs::read(&old_path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        tokio::fs::write(&old_path, &bytes).await.unwrap();

        let err = store.read_all().await.unwrap_err();
        assert!(matches!(err, Error::Log(LogError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path(), 1 << 20).await.unwrap();
        store.close().await.unwrap();
        let err = store.append(&partner(1)).await.unwrap_err();
        assert!(matches!(err, Error::Log(LogError::Closed)));
    }
}
