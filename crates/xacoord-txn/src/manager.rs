//! Transaction manager: begin, enlistment and completion on behalf of callers
//!
//! The caller's association with a transaction is carried explicitly in a
//! [`TxContext`] rather than in thread-local state. Suspending takes the
//! transaction out of the context, resuming puts it back.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use xacoord_common::config::TransactionConfig;
use xacoord_common::error::{Result, TransactionError};
use xacoord_common::metrics;
use xacoord_common::types::{Priority, RecoveryId, Xid, INVALID_RECOVERY_ID};

use crate::coordinator::TwoPhaseCoordinator;
use crate::enlistment::BranchState;
use crate::journal::{HeuristicJournal, HeuristicReport};
use crate::registry::ResourceRegistry;
use crate::transaction::{Status, Transaction, TxState};
use crate::xa::{CommitMode, EndFlag, StartFlag, XaErrorCode, XaResource};

/// A caller's current transaction association
#[derive(Debug, Default)]
pub struct TxContext {
    current: Option<Arc<Transaction>>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Arc<Transaction>> {
        self.current.as_ref()
    }
}

/// A transaction detached from its context by `suspend`
#[derive(Debug)]
pub struct SuspendedTransaction(Arc<Transaction>);

impl SuspendedTransaction {
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.0
    }
}

fn illegal_state(message: &str) -> xacoord_common::Error {
    TransactionError::IllegalState(message.to_string()).into()
}

/// Entry point for applications and resource adapters
pub struct TransactionManager {
    config: TransactionConfig,
    coordinator: Arc<TwoPhaseCoordinator>,
    registry: Arc<ResourceRegistry>,
    journal: Arc<HeuristicJournal>,
    /// Transactions begun here; a transaction every caller dropped falls out
    active: DashMap<u64, Weak<Transaction>>,
    next_local_id: AtomicU64,
    closed: AtomicBool,
}

impl TransactionManager {
    pub fn new(
        config: TransactionConfig,
        coordinator: Arc<TwoPhaseCoordinator>,
        registry: Arc<ResourceRegistry>,
        journal: Arc<HeuristicJournal>,
    ) -> Self {
        Self {
            config,
            coordinator,
            registry,
            journal,
            active: DashMap::new(),
            next_local_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Transaction demarcation
    // ========================================================================

    /// Begin a transaction and associate it with `ctx`
    ///
    /// `timeout_secs` of 0 selects the configured default.
    pub fn begin(&self, ctx: &mut TxContext, timeout_secs: u64) -> Result<Arc<Transaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransactionError::System("transaction service is shut down".to_string()).into());
        }
        if ctx.current.is_some() {
            return Err(TransactionError::NotSupported("nested transactions".to_string()).into());
        }

        let local_id = self.next_local_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(local_id, self.config.effective_timeout(timeout_secs)));
        txn.arm_timer();
        self.prune_abandoned();
        self.active.insert(local_id, Arc::downgrade(&txn));
        metrics::record_begin();

        debug!("Began {} (timeout {:?})", txn.xid(), txn.timeout());
        ctx.current = Some(Arc::clone(&txn));
        Ok(txn)
    }

    /// Commit the context's transaction and disassociate it
    pub async fn commit(&self, ctx: &mut TxContext) -> Result<()> {
        let txn = Self::take_active(ctx)?;
        let result = self.coordinator.commit(&txn).await;
        self.active.remove(&txn.local_id());
        result
    }

    /// Roll back the context's transaction and disassociate it
    pub async fn rollback(&self, ctx: &mut TxContext) -> Result<()> {
        let txn = Self::take_active(ctx)?;
        let result = self.coordinator.rollback(&txn).await;
        self.active.remove(&txn.local_id());
        result
    }

    fn take_active(ctx: &mut TxContext) -> Result<Arc<Transaction>> {
        let txn = ctx.current.take().ok_or_else(|| illegal_state("no transaction"))?;
        if txn.state() != TxState::Active {
            return Err(illegal_state("transaction is already completing"));
        }
        Ok(txn)
    }

    pub fn set_rollback_only(&self, ctx: &TxContext) -> Result<()> {
        let txn = ctx.current().ok_or_else(|| illegal_state("no transaction"))?;
        txn.set_rollback_only();
        Ok(())
    }

    pub fn status(&self, ctx: &TxContext) -> Status {
        ctx.current().map_or(Status::NoTransaction, |txn| txn.status())
    }

    /// Detach the current transaction, if any
    pub fn suspend(&self, ctx: &mut TxContext) -> Option<SuspendedTransaction> {
        ctx.current.take().map(SuspendedTransaction)
    }

    /// Reattach a suspended transaction
    pub fn resume(&self, ctx: &mut TxContext, suspended: SuspendedTransaction) -> Result<()> {
        if ctx.current.is_some() {
            return Err(illegal_state("context already has a transaction"));
        }
        if suspended.0.state().is_finished() {
            return Err(illegal_state("transaction has completed"));
        }
        ctx.current = Some(suspended.0);
        Ok(())
    }

    // ========================================================================
    // Enlistment
    // ========================================================================

    /// Enlist a resource in the context's transaction
    ///
    /// Returns false when the resource is already enlisted and active, or was
    /// delisted with FAIL. `recovery_id` comes from
    /// [`register_resource_info`](Self::register_resource_info); a resource
    /// without one enlists at priority 0 and cannot be recovered after a crash.
    pub async fn enlist(
        &self,
        ctx: &TxContext,
        resource: Arc<dyn XaResource>,
        recovery_id: RecoveryId,
    ) -> Result<bool> {
        let txn = ctx.current().ok_or_else(|| illegal_state("no transaction"))?;
        Self::check_enlistable(txn)?;

        let mut table = txn.enlistments.lock().await;

        if let Some(index) = table.find(&resource) {
            let e = table.get_mut(index);
            let flag = match e.state {
                BranchState::Active | BranchState::Failed => return Ok(false),
                BranchState::Suspended => StartFlag::Resume,
                BranchState::Ended => StartFlag::Join,
            };
            return match e.resource.start(&e.xid, flag).await {
                Ok(()) => {
                    e.state = BranchState::Active;
                    Ok(true)
                }
                Err(err) => {
                    warn!("Re-enlisting {} in {} failed: {}", e.name, e.xid, err);
                    txn.set_rollback_only();
                    Err(Self::start_error(err.code, err.to_string()))
                }
            };
        }

        let (registration, priority) = self.resolve_registration(recovery_id);

        let one_phase_only = resource.commit_mode() == CommitMode::OnePhaseOnly;
        if one_phase_only {
            if table.one_phase_only().is_some() {
                return Err(illegal_state("a one-phase-only resource is already enlisted"));
            }
            if table.has_two_phase() && !self.config.accept_heuristic_hazard {
                return Err(illegal_state(
                    "one-phase-only resource cannot join two-phase resources",
                ));
            }
        } else if table.one_phase_only().is_some() && !self.config.accept_heuristic_hazard {
            return Err(illegal_state(
                "two-phase resource cannot join a one-phase-only resource",
            ));
        }

        let index = table.add(resource, txn.xid(), registration, priority);
        let e = table.get_mut(index);

        let remaining = txn.remaining_secs();
        if remaining > 0 {
            if let Err(err) = e.resource.set_transaction_timeout(remaining).await {
                debug!("{} ignored transaction timeout: {}", e.name, err);
            }
        }

        if let Err(err) = e.resource.start(&e.xid, StartFlag::NoFlags).await {
            warn!("Enlisting {} in {} failed: {}", e.name, e.xid, err);
            table.pop();
            txn.set_rollback_only();
            return Err(Self::start_error(err.code, err.to_string()));
        }

        debug!(
            "Enlisted {} as {} (priority {})",
            e.name, e.xid, e.priority
        );
        Ok(true)
    }

    fn check_enlistable(txn: &Transaction) -> Result<()> {
        match txn.state() {
            TxState::Active if txn.check_expired() => {
                Err(TransactionError::Rollback("transaction timed out".to_string()).into())
            }
            TxState::Active if txn.is_rollback_only() => Err(TransactionError::Rollback(
                "transaction marked rollback-only".to_string(),
            )
            .into()),
            TxState::Active => Ok(()),
            TxState::RollingBack | TxState::RolledBack => {
                Err(TransactionError::Rollback("transaction rolled back".to_string()).into())
            }
            state => Err(TransactionError::IllegalState(format!(
                "cannot enlist in a transaction that is {state:?}"
            ))
            .into()),
        }
    }

    fn resolve_registration(&self, recovery_id: RecoveryId) -> (Option<RecoveryId>, Priority) {
        if recovery_id >= 1 {
            if let Some(partner) = self.registry.lookup(recovery_id) {
                return (Some(recovery_id), partner.priority);
            }
            warn!("Recovery id {} is not registered, enlisting without recovery", recovery_id);
        } else {
            warn!("Enlisting resource without a recovery id; it cannot be recovered after a crash");
        }
        (None, 0)
    }

    fn start_error(code: XaErrorCode, message: String) -> xacoord_common::Error {
        if code == XaErrorCode::Rollback {
            TransactionError::Rollback(message).into()
        } else {
            TransactionError::System(message).into()
        }
    }

    /// End a resource's association with the context's transaction
    ///
    /// Returns false if the resource is not enlisted or its association has
    /// already ended.
    pub async fn delist(&self, ctx: &TxContext, resource: &Arc<dyn XaResource>, flag: EndFlag) -> Result<bool> {
        let txn = ctx.current().ok_or_else(|| illegal_state("no transaction"))?;
        if txn.state() != TxState::Active {
            return Err(illegal_state("transaction is not active"));
        }

        let mut table = txn.enlistments.lock().await;
        let Some(index) = table.find(resource) else {
            return Ok(false);
        };
        let e = table.get_mut(index);
        match (e.state, flag) {
            (BranchState::Ended | BranchState::Failed, _) | (BranchState::Suspended, EndFlag::Suspend) => {
                return Ok(false)
            }
            _ => {}
        }

        match e.resource.end(&e.xid, flag).await {
            Ok(()) => {
                e.state = match flag {
                    EndFlag::Success => BranchState::Ended,
                    EndFlag::Suspend => BranchState::Suspended,
                    EndFlag::Fail => {
                        txn.set_rollback_only();
                        BranchState::Failed
                    }
                };
                Ok(true)
            }
            Err(err) => {
                warn!("Delisting {} from {} failed: {}", e.name, e.xid, err);
                e.state = BranchState::Failed;
                txn.set_rollback_only();
                match err.code {
                    XaErrorCode::Rollback | XaErrorCode::RmFail => Ok(true),
                    _ => Err(TransactionError::System(err.to_string()).into()),
                }
            }
        }
    }

    // ========================================================================
    // Registration and administration
    // ========================================================================

    /// Register resource info for recovery, returning its recovery id or -1
    pub async fn register_resource_info(&self, factory: &str, info: &[u8], priority: Priority) -> RecoveryId {
        match self.registry.register(factory, info, priority).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to register resource info for factory {}: {}", factory, e);
                INVALID_RECOVERY_ID
            }
        }
    }

    /// Transactions that completed heuristically and have not been forgotten
    pub fn heuristic_transactions(&self) -> Vec<HeuristicReport> {
        self.journal.list()
    }

    /// Forget a heuristically completed transaction
    pub async fn forget_heuristic(&self, xid: &Xid) -> Result<bool> {
        self.coordinator.forget_heuristic(xid).await
    }

    pub fn active_count(&self) -> usize {
        self.prune_abandoned();
        self.active.len()
    }

    fn prune_abandoned(&self) {
        self.active.retain(|_, txn| txn.strong_count() > 0);
    }

    /// Refuse new transactions; returns how many are still running
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.prune_abandoned();
        for entry in self.active.iter() {
            if let Some(txn) = entry.value().upgrade() {
                txn.cancel_timer();
            }
        }
        let running = self.active.len();
        if running > 0 {
            info!("Shutting down with {} transactions still active", running);
        }
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{FactoryAdapter, FactoryRegistry};
    use crate::testing::{CallLog, Op, RecordingFatalHandler, ScriptedResource};
    use std::time::Duration;
    use xacoord_log::{MemoryLogStore, TransactionLog};

    async fn manager(config: TransactionConfig) -> TransactionManager {
        let log = Arc::new(TransactionLog::open(Arc::new(MemoryLogStore::new())).await.unwrap());
        let registry = Arc::new(ResourceRegistry::new(log.clone()));
        let adapter = Arc::new(FactoryAdapter::new(
            Arc::new(FactoryRegistry::new()),
            Arc::new(RecordingFatalHandler::default()),
        ));
        let journal = Arc::new(HeuristicJournal::new());
        let coordinator = Arc::new(TwoPhaseCoordinator::new(
            config.clone(),
            log,
            registry.clone(),
            adapter,
            journal.clone(),
        ));
        TransactionManager::new(config, coordinator, registry, journal)
    }

    #[tokio::test]
    async fn test_nested_begin_not_supported() {
        let tm = manager(TransactionConfig::default()).await;
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0).unwrap();
        let err = tm.begin(&mut ctx, 0).unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_enlist_is_idempotent_and_delist_once() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let db: Arc<dyn XaResource> = ScriptedResource::new("db", &calls);
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 30).unwrap();

        assert!(tm.enlist(&ctx, db.clone(), 0).await.unwrap());
        assert!(!tm.enlist(&ctx, db.clone(), 0).await.unwrap());
        assert!(tm.delist(&ctx, &db, EndFlag::Success).await.unwrap());
        assert!(!tm.delist(&ctx, &db, EndFlag::Success).await.unwrap());

        // rejoining an ended branch
        assert!(tm.enlist(&ctx, db.clone(), 0).await.unwrap());
        assert_eq!(calls.ops_for("db"), vec![Op::Start, Op::End, Op::Start]);

        tm.commit(&mut ctx).await.unwrap();
        assert_eq!(tm.status(&ctx), Status::NoTransaction);
        assert_eq!(tm.active_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_passed_to_resource() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let db = ScriptedResource::new("db", &calls);
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 45).unwrap();

        tm.enlist(&ctx, db.clone(), 0).await.unwrap();
        assert_eq!(db.timeout_secs(), 45);
    }

    #[tokio::test]
    async fn test_failed_start_marks_rollback_only() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let db = ScriptedResource::new("db", &calls);
        db.fail_next(Op::Start, XaErrorCode::RmErr);
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0).unwrap();

        let err = tm.enlist(&ctx, db, 0).await.unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::System(_))));
        assert_eq!(tm.status(&ctx), Status::MarkedRollback);
        assert!(ctx.current().unwrap().enlistments.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_phase_only_mixing_rejected() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0).unwrap();

        tm.enlist(&ctx, ScriptedResource::new("xa", &calls), 0).await.unwrap();
        let err = tm
            .enlist(&ctx, ScriptedResource::one_phase_only("local", &calls), 0)
            .await
            .unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_registered_priority_used() {
        let tm = manager(TransactionConfig::default()).await;
        let id = tm.register_resource_info("f", b"db", 7).await;
        assert_eq!(id, 1);
        assert_eq!(tm.register_resource_info("", b"db", 7).await, INVALID_RECOVERY_ID);

        let calls = CallLog::new();
        let mut ctx = TxContext::new();
        let txn = tm.begin(&mut ctx, 0).unwrap();
        tm.enlist(&ctx, ScriptedResource::new("db", &calls), id).await.unwrap();
        let table = txn.enlistments.lock().await;
        assert_eq!(table.entries()[0].priority, 7);
        assert_eq!(table.entries()[0].recovery_id, Some(1));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let tm = manager(TransactionConfig::default()).await;
        let mut ctx = TxContext::new();
        let txn = tm.begin(&mut ctx, 0).unwrap();

        let suspended = tm.suspend(&mut ctx).unwrap();
        assert_eq!(tm.status(&ctx), Status::NoTransaction);
        tm.begin(&mut ctx, 0).unwrap();
        let err = tm.resume(&mut ctx, suspended).unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::IllegalState(_))));

        let mut other = TxContext::new();
        tm.resume(&mut other, SuspendedTransaction(txn.clone())).unwrap();
        assert!(Arc::ptr_eq(other.current().unwrap(), &txn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enlist_after_timeout_is_rollback() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 1).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let err = tm.enlist(&ctx, ScriptedResource::new("db", &calls), 0).await.unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::Rollback(_))));
        assert!(calls.ops().is_empty());

        let err = tm.commit(&mut ctx).await.unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::Rollback(_))));
    }

    #[tokio::test]
    async fn test_failed_delist_rolls_back_every_branch() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();
        let orders: Arc<dyn XaResource> = ScriptedResource::new("orders", &calls);
        let ledger: Arc<dyn XaResource> = ScriptedResource::new("ledger", &calls);
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0).unwrap();
        tm.enlist(&ctx, orders.clone(), 0).await.unwrap();
        tm.enlist(&ctx, ledger.clone(), 0).await.unwrap();

        assert!(tm.delist(&ctx, &orders, EndFlag::Fail).await.unwrap());
        assert_eq!(tm.status(&ctx), Status::MarkedRollback);
        // a failed branch cannot rejoin
        assert!(!tm.enlist(&ctx, orders.clone(), 0).await.unwrap());

        let err = tm.commit(&mut ctx).await.unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::Rollback(_))));
        assert_eq!(calls.ops_for("orders"), vec![Op::Start, Op::End, Op::Rollback]);
        assert_eq!(calls.ops_for("ledger"), vec![Op::Start, Op::End, Op::Rollback]);
        assert_eq!(calls.count("orders", Op::Prepare) + calls.count("ledger", Op::Prepare), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_transaction_is_not_counted_active() {
        let tm = manager(TransactionConfig::default()).await;
        let calls = CallLog::new();

        let mut abandoned = TxContext::new();
        tm.begin(&mut abandoned, 1).unwrap();
        tm.enlist(&abandoned, ScriptedResource::new("db", &calls), 0).await.unwrap();

        let mut parked = TxContext::new();
        tm.begin(&mut parked, 1).unwrap();
        let suspended = tm.suspend(&mut parked).unwrap();
        assert_eq!(tm.active_count(), 2);

        drop(abandoned);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tm.active_count(), 1);

        // still reachable through the suspended handle
        assert!(suspended.transaction().is_timed_out());
        drop(suspended);
        assert_eq!(tm.active_count(), 0);
        assert_eq!(tm.shutdown(), 0);
    }

    #[tokio::test]
    async fn test_begin_after_shutdown_fails() {
        let tm = manager(TransactionConfig::default()).await;
        assert_eq!(tm.shutdown(), 0);
        let err = tm.begin(&mut TxContext::new(), 0).unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::System(_))));
    }
}
