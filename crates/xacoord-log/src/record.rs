//! Log record types and frame codec
//!
//! Every record is written as `[len u32 LE][crc32 u32 LE][bincode payload]`.

use serde::{Deserialize, Serialize};

use xacoord_common::error::{Error, LogError, Result};
use xacoord_common::types::{
    Decision, HeuristicOutcome, Priority, RecoveryId, ResourceStatus, Timestamp, Xid,
};

/// Frame header size: length prefix (4) + crc (4)
pub const FRAME_HEADER_LEN: usize = 8;

/// Frames larger than this are treated as garbage
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A single recovery log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Partner(PartnerRecord),
    Transaction(TransactionRecord),
    Completed(CompletedRecord),
}

impl LogRecord {
    /// Short label used for metrics and logging
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Partner(_) => "partner",
            LogRecord::Transaction(_) => "transaction",
            LogRecord::Completed(_) => "completed",
        }
    }
}

/// A resource-info registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerRecord {
    pub recovery_id: RecoveryId,
    pub factory: String,
    pub info: Vec<u8>,
    pub priority: Priority,
    pub written_at: Timestamp,
}

impl PartnerRecord {
    /// Whether this registration describes the same resource
    pub fn matches(&self, factory: &str, info: &[u8], priority: Priority) -> bool {
        self.factory == factory && self.info == info && self.priority == priority
    }
}

/// Logged state of a transaction past its decision point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoggedState {
    Committing,
    RollingBack,
    Heuristic(HeuristicOutcome),
}

/// One branch as recorded alongside a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Registration used to reconnect after a crash, if the branch has one
    pub recovery_id: Option<RecoveryId>,
    pub priority: Priority,
    pub bqual: Vec<u8>,
    pub resource_name: String,
    pub status: ResourceStatus,
}

/// Decision record for a global transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Global id (empty branch qualifier)
    pub xid: Xid,
    pub state: LoggedState,
    pub decision: Decision,
    pub branches: Vec<BranchRecord>,
    pub written_at: Timestamp,
}

impl TransactionRecord {
    pub fn gtrid(&self) -> &[u8] {
        self.xid.gtrid()
    }

    /// Full xid of a recorded branch
    pub fn branch_xid(&self, branch: &BranchRecord) -> Xid {
        self.xid.with_bqual(branch.bqual.clone())
    }

    /// Heuristic outcome recorded for this transaction, if any
    pub fn heuristic(&self) -> Option<HeuristicOutcome> {
        match self.state {
            LoggedState::Heuristic(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Still has branches to drive to completion
    ///
    /// A heuristic record stays pending while any branch never acknowledged
    /// the decision.
    pub fn is_pending(&self) -> bool {
        match self.state {
            LoggedState::Committing | LoggedState::RollingBack => true,
            LoggedState::Heuristic(_) => self.unresolved().next().is_some(),
        }
    }

    /// Branches that have not acknowledged the decision
    pub fn unresolved(&self) -> impl Iterator<Item = &BranchRecord> {
        self.branches.iter().filter(|b| !b.status.is_terminal())
    }
}

/// Marker that a transaction needs no further recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub gtrid: Vec<u8>,
    pub completed_at: Timestamp,
}

/// Encode a record as a checksummed frame
pub fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload = bincode::serialize(record)
        .map_err(|e| Error::Serialization(format!("Failed to encode log record: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            Error::Log(LogError::WriteFailed(format!(
                "record of {} bytes exceeds frame limit",
                payload.len()
            )))
        })?;
    let crc = crc32fast::hash(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of scanning a buffer of frames
#[derive(Debug)]
pub struct FrameScan {
    pub records: Vec<LogRecord>,
    /// Bytes covered by intact frames
    pub valid_len: usize,
    /// Trailing bytes did not form an intact frame
    pub torn: bool,
}

/// Decode every intact frame from the start of `buf`
///
/// Scanning stops at the first short or checksum-failing frame. A frame whose
/// checksum matches but whose payload cannot be decoded is an error.
pub fn decode_frames(buf: &[u8]) -> Result<FrameScan> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        if buf.len() - offset < FRAME_HEADER_LEN {
            break;
        }
        let len = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            buf[offset + 4],
            buf[offset + 5],
            buf[offset + 6],
            buf[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_LEN;
        if len > MAX_FRAME_LEN || buf.len() - start < len {
            break;
        }
        let payload = &buf[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        let record: LogRecord = bincode::deserialize(payload).map_err(|e| {
            Error::Log(LogError::Corrupt(format!(
                "undecodable record at offset {offset}: {e}"
            )))
        })?;
        records.push(record);
        offset = start + len;
    }

    Ok(FrameScan {
        records,
        valid_len: offset,
        torn: offset < buf.len(),
    })
}
