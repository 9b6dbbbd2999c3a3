//! XA resource SPI consumed by the coordinator

use std::fmt;

use async_trait::async_trait;

use xacoord_common::types::Xid;

/// Flags for `XaResource::start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    NoFlags,
    Join,
    Resume,
}

/// Flags for `XaResource::end` and `TransactionManager::delist`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    Suspend,
    Fail,
}

/// Prepare vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Ok,
    ReadOnly,
}

/// How a resource takes part in completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    TwoPhase,
    /// Cannot prepare; committed last with `commit(one_phase = true)`
    OnePhaseOnly,
}

/// XA return codes a resource manager can fail with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorCode {
    /// Any `XA_RB*` code: the branch was rolled back
    Rollback,
    HeuristicRollback,
    HeuristicCommit,
    HeuristicMixed,
    HeuristicHazard,
    Retry,
    NotA,
    RmFail,
    RmErr,
    Inval,
    Proto,
}

impl fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            XaErrorCode::Rollback => "XA_RB",
            XaErrorCode::HeuristicRollback => "XA_HEURRB",
            XaErrorCode::HeuristicCommit => "XA_HEURCOM",
            XaErrorCode::HeuristicMixed => "XA_HEURMIX",
            XaErrorCode::HeuristicHazard => "XA_HEURHAZ",
            XaErrorCode::Retry => "XA_RETRY",
            XaErrorCode::NotA => "XAER_NOTA",
            XaErrorCode::RmFail => "XAER_RMFAIL",
            XaErrorCode::RmErr => "XAER_RMERR",
            XaErrorCode::Inval => "XAER_INVAL",
            XaErrorCode::Proto => "XAER_PROTO",
        };
        f.write_str(s)
    }
}

/// Failure reported by a resource manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct XaError {
    pub code: XaErrorCode,
    pub message: String,
}

impl XaError {
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<XaErrorCode> for XaError {
    fn from(code: XaErrorCode) -> Self {
        Self::new(code, code.to_string())
    }
}

pub type XaResult<T> = std::result::Result<T, XaError>;

/// A resource-manager handle taking part in two-phase commit
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Name used in logs, log records and heuristic reports
    fn resource_name(&self) -> String;

    async fn start(&self, xid: &Xid, flag: StartFlag) -> XaResult<()>;

    async fn end(&self, xid: &Xid, flag: EndFlag) -> XaResult<()>;

    async fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    async fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    async fn rollback(&self, xid: &Xid) -> XaResult<()>;

    async fn forget(&self, xid: &Xid) -> XaResult<()>;

    /// Branches the resource manager holds prepared or heuristically completed
    async fn recover(&self) -> XaResult<Vec<Xid>>;

    /// Returns whether the resource accepted the timeout
    async fn set_transaction_timeout(&self, _secs: u64) -> XaResult<bool> {
        Ok(false)
    }

    /// Whether a lone voting branch may be committed without prepare
    fn supports_one_phase(&self) -> bool {
        true
    }

    fn commit_mode(&self) -> CommitMode {
        CommitMode::TwoPhase
    }
}
