//! Common type definitions for xacoord

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransactionError};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Identifier returned by resource-info registration
pub type RecoveryId = i32;

/// Commit priority; higher values prepare and commit first
pub type Priority = i32;

/// Recovery id returned when a registration could not be made durable
pub const INVALID_RECOVERY_ID: RecoveryId = -1;

/// Format id stamped on every xid this coordinator generates
pub const FORMAT_ID: i32 = 0x5841_434F;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Transaction Identifiers
// ============================================================================

/// XA transaction branch identifier
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    pub const MAX_GTRID_SIZE: usize = 64;
    pub const MAX_BQUAL_SIZE: usize = 64;

    /// Build an xid from its raw parts
    pub fn new(format_id: i32, gtrid: Vec<u8>, bqual: Vec<u8>) -> Result<Self> {
        if gtrid.is_empty() || gtrid.len() > Self::MAX_GTRID_SIZE {
            return Err(TransactionError::System(format!(
                "global transaction id must be 1..={} bytes, got {}",
                Self::MAX_GTRID_SIZE,
                gtrid.len()
            ))
            .into());
        }
        if bqual.len() > Self::MAX_BQUAL_SIZE {
            return Err(TransactionError::System(format!(
                "branch qualifier must be at most {} bytes, got {}",
                Self::MAX_BQUAL_SIZE,
                bqual.len()
            ))
            .into());
        }
        Ok(Self { format_id, gtrid, bqual })
    }

    /// Generate a fresh global id for the given local transaction id
    pub fn generate(local_id: u64) -> Self {
        let mut gtrid = Vec::with_capacity(24);
        gtrid.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        gtrid.extend_from_slice(&local_id.to_be_bytes());
        Self {
            format_id: FORMAT_ID,
            gtrid,
            bqual: Vec::new(),
        }
    }

    /// Derive the xid of branch `n` of this global transaction
    #[must_use]
    pub fn branch(&self, n: u32) -> Self {
        Self {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual: n.to_be_bytes().to_vec(),
        }
    }

    /// The same global transaction with a caller-supplied qualifier
    #[must_use]
    pub fn with_bqual(&self, bqual: Vec<u8>) -> Self {
        Self {
            format_id: self.format_id,
            gtrid: self.gtrid.clone(),
            bqual,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Whether this xid was generated by an xacoord coordinator
    pub fn is_ours(&self) -> bool {
        self.format_id == FORMAT_ID
    }

    /// Whether both xids belong to the same global transaction
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}:{}:{}",
            self.format_id,
            hex::encode(&self.gtrid),
            hex::encode(&self.bqual)
        )
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

// ============================================================================
// Completion States
// ============================================================================

/// Outcome the coordinator decided for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Rollback,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Rollback => write!(f, "rollback"),
        }
    }
}

/// Heuristic outcome of a transaction whose branches diverged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeuristicOutcome {
    /// Every branch committed although rollback was decided
    Commit,
    /// Every branch rolled back although commit was decided
    Rollback,
    /// Some branches committed and some rolled back
    Mixed,
    /// The outcome of at least one branch is unknown
    Hazard,
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeuristicOutcome::Commit => write!(f, "heuristic commit"),
            HeuristicOutcome::Rollback => write!(f, "heuristic rollback"),
            HeuristicOutcome::Mixed => write!(f, "heuristic mixed"),
            HeuristicOutcome::Hazard => write!(f, "heuristic hazard"),
        }
    }
}

/// Completion status of a single transaction branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Registered,
    Prepared,
    Completing,
    Committed,
    RolledBack,
    /// Voted read-only, was forgotten, or the RM no longer knows the branch
    Completed,
    HeuristicCommit,
    HeuristicRollback,
    HeuristicMixed,
    HeuristicHazard,
}

impl ResourceStatus {
    /// Nothing more will be sent to the branch except `forget`
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ResourceStatus::Registered | ResourceStatus::Prepared | ResourceStatus::Completing
        )
    }

    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            ResourceStatus::HeuristicCommit
                | ResourceStatus::HeuristicRollback
                | ResourceStatus::HeuristicMixed
                | ResourceStatus::HeuristicHazard
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Registered => "registered",
            ResourceStatus::Prepared => "prepared",
            ResourceStatus::Completing => "completing",
            ResourceStatus::Committed => "committed",
            ResourceStatus::RolledBack => "rolled-back",
            ResourceStatus::Completed => "completed",
            ResourceStatus::HeuristicCommit => "heuristic-commit",
            ResourceStatus::HeuristicRollback => "heuristic-rollback",
            ResourceStatus::HeuristicMixed => "heuristic-mixed",
            ResourceStatus::HeuristicHazard => "heuristic-hazard",
        };
        f.write_str(s)
    }
}
