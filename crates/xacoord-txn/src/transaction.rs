//! Transaction objects and their lifecycle state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use xacoord_common::metrics;
use xacoord_common::types::{HeuristicOutcome, Xid};

use crate::enlistment::EnlistmentTable;

/// Coordinator-side transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Heuristic(HeuristicOutcome),
}

impl TxState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Heuristic(_)
        )
    }
}

/// Status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoTransaction,
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Heuristic(HeuristicOutcome),
}

/// A global transaction
pub struct Transaction {
    xid: Xid,
    local_id: u64,
    state: RwLock<TxState>,
    rollback_only: AtomicBool,
    timed_out: AtomicBool,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    /// Held across XA calls while enlisting, delisting and completing
    pub(crate) enlistments: tokio::sync::Mutex<EnlistmentTable>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Transaction {
    /// `timeout` of zero means the transaction never times out
    pub(crate) fn new(local_id: u64, timeout: Duration) -> Self {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        Self {
            xid: Xid::generate(local_id),
            local_id,
            state: RwLock::new(TxState::Active),
            rollback_only: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            enlistments: tokio::sync::Mutex::new(EnlistmentTable::new()),
            timer: Mutex::new(None),
        }
    }

    /// Global id (empty branch qualifier)
    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn state(&self) -> TxState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: TxState) {
        *self.state.write() = state;
    }

    pub fn status(&self) -> Status {
        match self.state() {
            TxState::Active if self.is_rollback_only() => Status::MarkedRollback,
            TxState::Active => Status::Active,
            TxState::Preparing => Status::Preparing,
            TxState::Prepared => Status::Prepared,
            TxState::Committing => Status::Committing,
            TxState::Committed => Status::Committed,
            TxState::RollingBack => Status::RollingBack,
            TxState::RolledBack => Status::RolledBack,
            TxState::Heuristic(outcome) => Status::Heuristic(outcome),
        }
    }

    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Whether the deadline has passed, flagging the timeout if so
    pub fn check_expired(&self) -> bool {
        if self.is_timed_out() {
            return true;
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.mark_timed_out();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_timed_out(&self) {
        if !self.timed_out.swap(true, Ordering::SeqCst) {
            self.set_rollback_only();
            metrics::record_timeout();
            info!("Transaction {} timed out, marked rollback-only", self.xid);
        }
    }

    /// Seconds left before the deadline, rounded up (0 = no deadline)
    pub fn remaining_secs(&self) -> u64 {
        self.deadline.map_or(0, |deadline| {
            let left = deadline.saturating_duration_since(Instant::now());
            (left.as_millis().div_ceil(1000)).try_into().unwrap_or(u64::MAX).max(1)
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Spawn the task that marks the transaction rollback-only at its deadline
    pub(crate) fn arm_timer(self: &Arc<Self>) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let txn: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(txn) = txn.upgrade() {
                if txn.state() == TxState::Active {
                    txn.mark_timed_out();
                }
            }
        });
        *self.timer.lock() = Some(handle);
    }

    pub(crate) fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cancel_timer();
        let state = self.state();
        if state.is_finished() {
            return;
        }
        let branches = self.enlistments.get_mut().len();
        if branches > 0 {
            warn!(
                "Transaction {} dropped while {:?} with {} enlisted branches",
                self.xid, state, branches
            );
        }
        metrics::record_abandoned();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("local_id", &self.local_id)
            .field("state", &self.state())
            .field("rollback_only", &self.is_rollback_only())
            .finish_non_exhaustive()
    }
}
