//! Storage abstraction behind the recovery log

use async_trait::async_trait;

use xacoord_common::error::Result;

use crate::record::LogRecord;

/// Append-only record store
///
/// `append` only buffers; a record is durable once a later `force` returns.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a record, returning its sequence number
    async fn append(&self, record: &LogRecord) -> Result<u64>;

    /// Make every appended record durable
    async fn force(&self) -> Result<()>;

    /// Read back every record in append order
    async fn read_all(&self) -> Result<Vec<LogRecord>>;

    /// Atomically replace the log contents with `records`
    async fn rewrite(&self, records: &[LogRecord]) -> Result<()>;

    /// Flush and release the store
    async fn close(&self) -> Result<()> {
        self.force().await
    }
}
