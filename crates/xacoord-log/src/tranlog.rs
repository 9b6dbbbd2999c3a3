//! Indexed view over the recovery log

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use xacoord_common::error::Result;
use xacoord_common::types::{now_millis, RecoveryId, Timestamp};

use crate::record::{CompletedRecord, LogRecord, PartnerRecord, TransactionRecord};
use crate::store::LogStore;

#[derive(Default)]
struct LogIndex {
    partners: BTreeMap<RecoveryId, PartnerRecord>,
    /// Latest record per gtrid that has not completed
    transactions: HashMap<Vec<u8>, TransactionRecord>,
    /// Completion markers per gtrid
    completed: HashMap<Vec<u8>, Timestamp>,
}

impl LogIndex {
    fn apply(&mut self, record: LogRecord) {
        match record {
            LogRecord::Partner(partner) => {
                self.partners.insert(partner.recovery_id, partner);
            }
            LogRecord::Transaction(txn) => {
                let gtrid = txn.gtrid().to_vec();
                self.completed.remove(&gtrid);
                self.transactions.insert(gtrid, txn);
            }
            LogRecord::Completed(done) => {
                self.transactions.remove(&done.gtrid);
                self.completed.insert(done.gtrid, done.completed_at);
            }
        }
    }
}

/// Counts from a prune
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub partners: usize,
    pub transactions: usize,
    pub completed_kept: usize,
    pub completed_dropped: usize,
}

/// Recovery log: durable store plus an in-memory index of what it holds
pub struct TransactionLog {
    store: Arc<dyn LogStore>,
    index: RwLock<LogIndex>,
    /// Appends share it; prune takes it exclusively
    prune_lock: tokio::sync::RwLock<()>,
}

impl TransactionLog {
    /// Open the log and replay everything in the store
    pub async fn open(store: Arc<dyn LogStore>) -> Result<Self> {
        let records = store.read_all().await?;
        let count = records.len();

        let mut index = LogIndex::default();
        for record in records {
            index.apply(record);
        }

        info!(
            "Recovery log replayed: {} records, {} partners, {} unresolved transactions",
            count,
            index.partners.len(),
            index.transactions.len()
        );

        Ok(Self {
            store,
            index: RwLock::new(index),
            prune_lock: tokio::sync::RwLock::new(()),
        })
    }

    async fn write(&self, record: LogRecord, force: bool) -> Result<()> {
        let _shared = self.prune_lock.read().await;
        self.store.append(&record).await?;
        if force {
            self.store.force().await?;
        }
        self.index.write().apply(record);
        Ok(())
    }

    /// Durably record a resource registration
    pub async fn log_partner(&self, partner: PartnerRecord) -> Result<()> {
        debug!(
            "Logging partner {} (factory {})",
            partner.recovery_id, partner.factory
        );
        self.write(LogRecord::Partner(partner), true).await
    }

    /// Durably record a transaction decision or heuristic outcome
    pub async fn log_transaction(&self, record: TransactionRecord) -> Result<()> {
        debug!("Logging {:?} for {}", record.state, record.xid);
        self.write(LogRecord::Transaction(record), true).await
    }

    /// Mark a transaction as needing no further recovery
    ///
    /// Not forced: losing the marker only causes a redundant re-drive.
    pub async fn log_completed(&self, gtrid: &[u8]) -> Result<()> {
        self.write(
            LogRecord::Completed(CompletedRecord {
                gtrid: gtrid.to_vec(),
                completed_at: now_millis(),
            }),
            false,
        )
        .await
    }

    /// Mark a transaction complete and force the marker
    pub async fn log_forgotten(&self, gtrid: &[u8]) -> Result<()> {
        self.write(
            LogRecord::Completed(CompletedRecord {
                gtrid: gtrid.to_vec(),
                completed_at: now_millis(),
            }),
            true,
        )
        .await
    }

    pub async fn force(&self) -> Result<()> {
        self.store.force().await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    /// Registered partners in recovery id order
    pub fn partners(&self) -> Vec<PartnerRecord> {
        self.index.read().partners.values().cloned().collect()
    }

    pub fn partner(&self, recovery_id: RecoveryId) -> Option<PartnerRecord> {
        self.index.read().partners.get(&recovery_id).cloned()
    }

    /// Highest recovery id ever logged (0 when none)
    pub fn max_recovery_id(&self) -> RecoveryId {
        self.index
            .read()
            .partners
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    /// Transactions with a decision whose branches are not all complete
    pub fn pending(&self) -> Vec<TransactionRecord> {
        let mut pending: Vec<_> = self
            .index
            .read()
            .transactions
            .values()
            .filter(|txn| txn.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|txn| txn.written_at);
        pending
    }

    /// Transactions that ended with a heuristic outcome
    pub fn heuristics(&self) -> Vec<TransactionRecord> {
        let mut heuristics: Vec<_> = self
            .index
            .read()
            .transactions
            .values()
            .filter(|txn| txn.heuristic().is_some())
            .cloned()
            .collect();
        heuristics.sort_by_key(|txn| txn.written_at);
        heuristics
    }

    /// Latest unresolved record for a gtrid
    pub fn transaction(&self, gtrid: &[u8]) -> Option<TransactionRecord> {
        self.index.read().transactions.get(gtrid).cloned()
    }

    pub fn is_completed(&self, gtrid: &[u8]) -> bool {
        self.index.read().completed.contains_key(gtrid)
    }

    /// Rewrite the log without completion markers older than `window`
    pub async fn prune(&self, window: Duration) -> Result<PruneStats> {
        let _exclusive = self.prune_lock.write().await;

        let cutoff = now_millis() - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let (records, stats, keep) = {
            let index = self.index.read();
            let mut records = Vec::new();
            let mut stats = PruneStats::default();

            for partner in index.partners.values() {
                records.push(LogRecord::Partner(partner.clone()));
                stats.partners += 1;
            }

            let mut transactions: Vec<_> = index.transactions.values().cloned().collect();
            transactions.sort_by_key(|txn| txn.written_at);
            stats.transactions = transactions.len();
            records.extend(transactions.into_iter().map(LogRecord::Transaction));

            let mut keep = HashMap::new();
            for (gtrid, completed_at) in &index.completed {
                if *completed_at >= cutoff {
                    keep.insert(gtrid.clone(), *completed_at);
                    records.push(LogRecord::Completed(CompletedRecord {
                        gtrid: gtrid.clone(),
                        completed_at: *completed_at,
                    }));
                    stats.completed_kept += 1;
                } else {
                    stats.completed_dropped += 1;
                }
            }
            (records, stats, keep)
        };

        self.store.rewrite(&records).await?;
        self.index.write().completed = keep;

        info!(
            "Recovery log pruned: kept {} partners, {} transactions, {} completion markers; dropped {}",
            stats.partners, stats.transactions, stats.completed_kept, stats.completed_dropped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLogStore;
    use crate::record::{BranchRecord, LoggedState};
    use xacoord_common::types::{Decision, HeuristicOutcome, ResourceStatus, Xid};

    fn decision(xid: &Xid, state: LoggedState) -> TransactionRecord {
        TransactionRecord {
            xid: xid.clone(),
            state,
            decision: Decision::Commit,
            branches: vec![BranchRecord {
                recovery_id: Some(1),
                priority: 0,
                bqual: vec![0, 0, 0, 1],
                resource_name: "db".to_string(),
                status: ResourceStatus::Prepared,
            }],
            written_at: now_millis(),
        }
    }

    fn partner(id: RecoveryId) -> PartnerRecord {
        PartnerRecord {
            recovery_id: id,
            factory: "f".to_string(),
            info: vec![],
            priority: 0,
            written_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_replay_builds_index() {
        let store = Arc::new(MemoryLogStore::new());
        let done = Xid::generate(1);
        let open = Xid::generate(2);
        let mixed = Xid::generate(3);
        {
            let log = TransactionLog::open(store.clone()).await.unwrap();
            log.log_partner(partner(1)).await.unwrap();
            log.log_partner(partner(4)).await.unwrap();
            log.log_transaction(decision(&done, LoggedState::Committing)).await.unwrap();
            log.log_transaction(decision(&open, LoggedState::Committing)).await.unwrap();
            log.log_transaction(decision(&mixed, LoggedState::Heuristic(HeuristicOutcome::Mixed)))
                .await
                .unwrap();
            log.log_completed(done.gtrid()).await.unwrap();
        }

        let log = TransactionLog::open(store).await.unwrap();
        assert_eq!(log.max_recovery_id(), 4);
        assert_eq!(log.partners().len(), 2);
        assert!(log.is_completed(done.gtrid()));
        let pending = log.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].xid, open);
        assert_eq!(log.heuristics()[0].xid, mixed);
    }

    #[tokio::test]
    async fn test_unforced_completion_lost_in_crash() {
        let store = Arc::new(MemoryLogStore::new());
        let xid = Xid::generate(1);
        let log = TransactionLog::open(store.clone()).await.unwrap();
        log.log_transaction(decision(&xid, LoggedState::Committing)).await.unwrap();
        log.log_completed(xid.gtrid()).await.unwrap();

        let recovered = TransactionLog::open(Arc::new(store.crash_image())).await.unwrap();
        assert_eq!(recovered.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_drops_old_markers_only() {
        let store = Arc::new(MemoryLogStore::new());
        let log = TransactionLog::open(store.clone()).await.unwrap();
        let finished = Xid::generate(1);
        let open = Xid::generate(2);
        log.log_partner(partner(1)).await.unwrap();
        log.log_transaction(decision(&finished, LoggedState::Committing)).await.unwrap();
        log.log_completed(finished.gtrid()).await.unwrap();
        log.log_transaction(decision(&open, LoggedState::Committing)).await.unwrap();

        let stats = log.prune(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.completed_kept, 1);
        assert_eq!(store.records().len(), 3);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stats = log.prune(Duration::ZERO).await.unwrap();
        assert_eq!(stats.completed_dropped, 1);
        assert_eq!(stats.transactions, 1);
        assert_eq!(store.records().len(), 2);
        assert!(!log.is_completed(finished.gtrid()));
        assert_eq!(log.pending().len(), 1);
    }
}
