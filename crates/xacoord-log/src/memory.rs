//! In-memory log store

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use xacoord_common::error::{LogError, Result};
use xacoord_common::metrics;

use crate::record::{decode_frames, encode_frame, LogRecord};
use crate::store::LogStore;

#[derive(Default)]
struct Frames {
    frames: Vec<Vec<u8>>,
    /// Number of frames covered by the last force
    forced: usize,
}

/// Log store held in memory, framed exactly like the file store
///
/// `crash_image` returns what a process crash would leave behind: only the
/// records covered by a completed `force`.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<Frames>,
    fail_writes: AtomicBool,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding `records`, all of them forced
    pub fn with_records(records: &[LogRecord]) -> Result<Self> {
        let frames = records.iter().map(encode_frame).collect::<Result<Vec<_>>>()?;
        let forced = frames.len();
        Ok(Self {
            inner: Mutex::new(Frames { frames, forced }),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Durable contents at this instant, as seen after a crash
    pub fn crash_image(&self) -> Self {
        let inner = self.inner.lock();
        let frames = inner.frames[..inner.forced].to_vec();
        let forced = frames.len();
        Self {
            inner: Mutex::new(Frames { frames, forced }),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make appends and forces fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Records appended so far, forced or not
    pub fn records(&self) -> Vec<LogRecord> {
        let inner = self.inner.lock();
        inner
            .frames
            .iter()
            .filter_map(|frame| decode_frames(frame).ok())
            .flat_map(|scan| scan.records)
            .collect()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LogError::WriteFailed("injected write failure".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, record: &LogRecord) -> Result<u64> {
        self.check_writable()?;
        let frame = encode_frame(record)?;
        metrics::record_log_append(record.kind(), frame.len() as u64);

        let mut inner = self.inner.lock();
        inner.frames.push(frame);
        Ok(inner.frames.len() as u64)
    }

    async fn force(&self) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.forced = inner.frames.len();
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<LogRecord>> {
        let inner = self.inner.lock();
        let mut records = Vec::with_capacity(inner.frames.len());
        for frame in &inner.frames {
            records.extend(decode_frames(frame)?.records);
        }
        Ok(records)
    }

    async fn rewrite(&self, records: &[LogRecord]) -> Result<()> {
        self.check_writable()?;
        let frames = records.iter().map(encode_frame).collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.lock();
        inner.forced = frames.len();
        inner.frames = frames;
        Ok(())
    }
}
