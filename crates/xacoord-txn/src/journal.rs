//! Administrator view of transactions that completed heuristically

use dashmap::DashMap;
use serde::Serialize;

use xacoord_common::types::{Decision, HeuristicOutcome, Timestamp, Xid};
use xacoord_log::{BranchRecord, TransactionRecord};

/// A diverged transaction and the status of each of its branches
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeuristicReport {
    pub xid: Xid,
    pub decision: Decision,
    pub outcome: HeuristicOutcome,
    pub branches: Vec<BranchRecord>,
    pub recorded_at: Timestamp,
}

impl HeuristicReport {
    pub fn from_record(record: &TransactionRecord) -> Option<Self> {
        record.heuristic().map(|outcome| Self {
            xid: record.xid.clone(),
            decision: record.decision,
            outcome,
            branches: record.branches.clone(),
            recorded_at: record.written_at,
        })
    }

    /// Branches whose status is itself heuristic
    pub fn diverged(&self) -> impl Iterator<Item = &BranchRecord> {
        self.branches.iter().filter(|b| b.status.is_heuristic())
    }

    /// Branches that never acknowledged the decision
    pub fn unresolved(&self) -> impl Iterator<Item = &BranchRecord> {
        self.branches.iter().filter(|b| !b.status.is_terminal())
    }
}

/// Heuristic reports keyed by gtrid
#[derive(Default)]
pub struct HeuristicJournal {
    entries: DashMap<Vec<u8>, HeuristicReport>,
}

impl HeuristicJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: HeuristicReport) {
        self.entries.insert(report.xid.gtrid().to_vec(), report);
    }

    /// Load every heuristic record found in the log
    pub fn load<'a>(&self, records: impl IntoIterator<Item = &'a TransactionRecord>) -> usize {
        let mut loaded = 0;
        for report in records.into_iter().filter_map(HeuristicReport::from_record) {
            self.record(report);
            loaded += 1;
        }
        loaded
    }

    pub fn get(&self, gtrid: &[u8]) -> Option<HeuristicReport> {
        self.entries.get(gtrid).map(|r| r.value().clone())
    }

    pub fn remove(&self, gtrid: &[u8]) -> Option<HeuristicReport> {
        self.entries.remove(gtrid).map(|(_, report)| report)
    }

    /// Reports, oldest first
    pub fn list(&self) -> Vec<HeuristicReport> {
        let mut reports: Vec<_> = self.entries.iter().map(|r| r.value().clone()).collect();
        reports.sort_by_key(|r| r.recorded_at);
        reports
    }
}
