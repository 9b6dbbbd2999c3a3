//! Integration tests for xacoord
//!
//! These tests drive the transaction service end to end with scripted
//! resource managers, including crashes simulated through the in-memory log
//! store's crash image.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use xacoord_common::config::Config;
use xacoord_common::error::TransactionError;
use xacoord_common::types::{
    now_millis, Decision, HeuristicOutcome, RecoveryId, ResourceStatus, Xid,
};
use xacoord_log::{BranchRecord, LogRecord, LoggedState, MemoryLogStore, PartnerRecord, TransactionRecord};
use xacoord_txn::testing::{CallLog, Op, RecordingFatalHandler, ScriptedFactory, ScriptedResource};
use xacoord_txn::{EndFlag, FactoryRegistry, TransactionService, TxContext, XaErrorCode, XaResource};

const FACTORY: &str = "scripted";

/// Scripted resource managers behind one factory, plus the log store
struct Harness {
    store: Arc<MemoryLogStore>,
    factories: Arc<FactoryRegistry>,
    factory: Arc<ScriptedFactory>,
    fatal: Arc<RecordingFatalHandler>,
    calls: Arc<CallLog>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryLogStore::new()))
    }

    fn with_store(store: Arc<MemoryLogStore>) -> Self {
        let factory = ScriptedFactory::new();
        let factories = Arc::new(FactoryRegistry::new());
        factories.register(FACTORY, factory.clone());
        Self {
            store,
            factories,
            factory,
            fatal: Arc::new(RecordingFatalHandler::default()),
            calls: CallLog::new(),
        }
    }

    /// A resource reachable through the factory under `name` as its info
    fn resource(&self, name: &str) -> Arc<ScriptedResource> {
        let resource = ScriptedResource::new(name, &self.calls);
        self.factory.add(name.as_bytes(), resource.clone());
        resource
    }

    async fn start(&self) -> xacoord_common::Result<TransactionService> {
        self.start_with(&test_config()).await
    }

    async fn start_with(&self, config: &Config) -> xacoord_common::Result<TransactionService> {
        TransactionService::start(
            config,
            self.store.clone(),
            self.factories.clone(),
            self.fatal.clone(),
        )
        .await
    }

    /// Same resources and factories, restarted on what survived a crash
    fn after_crash(&self) -> Self {
        Self {
            store: Arc::new(self.store.crash_image()),
            factories: self.factories.clone(),
            factory: self.factory.clone(),
            fatal: self.fatal.clone(),
            calls: self.calls.clone(),
        }
    }

    fn calls_of(&self, op: Op) -> Vec<String> {
        self.calls
            .ops()
            .into_iter()
            .filter(|(_, o)| *o == op)
            .map(|(name, _)| name)
            .collect()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.transaction.heuristic_retry_interval_ms = 1;
    config.recovery.retry_interval_ms = 10;
    config
}

async fn register(service: &TransactionService, name: &str, priority: i32) -> RecoveryId {
    service
        .manager()
        .register_resource_info(FACTORY, name.as_bytes(), priority)
        .await
}

fn as_xa(resource: &Arc<ScriptedResource>) -> Arc<dyn XaResource> {
    resource.clone()
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_factory_priorities_order_prepare_and_commit() {
    let h = Harness::new();
    let a = h.resource("A");
    let b = h.resource("B");
    let service = h.start().await.unwrap();

    let id_a = service
        .manager()
        .register_resource_info("FactoryA", b"cfgA", 10)
        .await;
    let id_b = service
        .manager()
        .register_resource_info("FactoryB", b"cfgB", 5)
        .await;
    assert_eq!((id_a, id_b), (1, 2));

    let tm = service.manager();
    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    // enlisted lowest priority first
    tm.enlist(&ctx, as_xa(&b), id_b).await.unwrap();
    tm.enlist(&ctx, as_xa(&a), id_a).await.unwrap();
    tm.commit(&mut ctx).await.unwrap();

    assert_eq!(h.calls_of(Op::Prepare), vec!["A", "B"]);
    assert_eq!(h.calls_of(Op::Commit), vec!["A", "B"]);
}

#[tokio::test]
async fn test_priority_order_holds_across_retries() {
    let h = Harness::new();
    let a = h.resource("A");
    let b = h.resource("B");
    let c = h.resource("C");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let id_a = register(&service, "A", 10).await;
    let id_b = register(&service, "B", 5).await;
    let id_c = register(&service, "C", 10).await;
    a.fail_next(Op::Commit, XaErrorCode::RmFail);

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&a), id_a).await.unwrap();
    tm.enlist(&ctx, as_xa(&b), id_b).await.unwrap();
    tm.enlist(&ctx, as_xa(&c), id_c).await.unwrap();
    tm.commit(&mut ctx).await.unwrap();

    // B waits until every priority-10 branch has committed
    assert_eq!(h.calls_of(Op::Commit), vec!["A", "C", "A", "B"]);
    // the failed branch was reconnected through its factory and released
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.destroyed(), 1);
}

// ============================================================================
// Commit paths
// ============================================================================

#[tokio::test]
async fn test_single_resource_sees_only_one_phase_commit() {
    let h = Harness::new();
    let a = h.resource("A");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&a), 0).await.unwrap();
    tm.commit(&mut ctx).await.unwrap();

    assert_eq!(h.calls.ops_for("A"), vec![Op::Start, Op::End, Op::CommitOnePhase]);
    assert!(h.store.records().is_empty());
}

#[tokio::test]
async fn test_last_participant_commits_after_decision() {
    let h = Harness::new();
    let xa = h.resource("xa");
    let local = ScriptedResource::one_phase_only("local", &h.calls);
    let mut config = test_config();
    config.transaction.accept_heuristic_hazard = true;
    let service = TransactionService::start(&config, h.store.clone(), h.factories.clone(), h.fatal.clone())
        .await
        .unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&xa), 0).await.unwrap();
    tm.enlist(&ctx, as_xa(&local), 0).await.unwrap();
    tm.commit(&mut ctx).await.unwrap();

    let order: Vec<_> = h
        .calls
        .ops()
        .into_iter()
        .filter(|(_, op)| matches!(op, Op::Prepare | Op::Commit | Op::CommitOnePhase))
        .collect();
    assert_eq!(
        order,
        vec![
            ("xa".to_string(), Op::Prepare),
            ("local".to_string(), Op::CommitOnePhase),
            ("xa".to_string(), Op::Commit),
        ]
    );
}

#[tokio::test]
async fn test_rollback_reaches_every_branch() {
    let h = Harness::new();
    let a = h.resource("A");
    let b = h.resource("B");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&a), 0).await.unwrap();
    tm.enlist(&ctx, as_xa(&b), 0).await.unwrap();
    tm.rollback(&mut ctx).await.unwrap();

    assert_eq!(h.calls_of(Op::Rollback), vec!["A", "B"]);
    assert!(h.calls_of(Op::Prepare).is_empty());
}

// ============================================================================
// Enlistment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_enlist_after_timeout_is_rollback() {
    let h = Harness::new();
    let a = h.resource("A");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 5).unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let err = tm.enlist(&ctx, as_xa(&a), 0).await.unwrap_err();
    assert!(matches!(err.as_transaction(), Some(TransactionError::Rollback(_))));
    assert!(h.calls.ops_for("A").is_empty());
}

#[tokio::test]
async fn test_double_delist_is_a_no_op() {
    let h = Harness::new();
    let a = h.resource("A");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    let resource = as_xa(&a);
    tm.enlist(&ctx, resource.clone(), 0).await.unwrap();

    assert!(tm.delist(&ctx, &resource, EndFlag::Success).await.unwrap());
    assert!(!tm.delist(&ctx, &resource, EndFlag::Success).await.unwrap());
    assert_eq!(h.calls.count("A", Op::End), 1);
}

#[tokio::test]
async fn test_suspended_branch_is_resumed() {
    let h = Harness::new();
    let a = h.resource("A");
    let service = h.start().await.unwrap();
    let tm = service.manager();

    let mut ctx = TxContext::new();
    tm.begin(&mut ctx, 0).unwrap();
    let resource = as_xa(&a);
    tm.enlist(&ctx, resource.clone(), 0).await.unwrap();
    assert!(tm.delist(&ctx, &resource, EndFlag::Suspend).await.unwrap());
    assert!(!tm.delist(&ctx, &resource, EndFlag::Suspend).await.unwrap());
    assert!(tm.enlist(&ctx, resource.clone(), 0).await.unwrap());

    assert_eq!(h.calls.ops_for("A"), vec![Op::Start, Op::End, Op::Start]);
    tm.commit(&mut ctx).await.unwrap();
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_recovery_ids_are_stable_across_restart() {
    let h = Harness::new();
    let service = h.start().await.unwrap();
    let first = register(&service, "A", 1).await;
    let second = register(&service, "B", 2).await;
    service.shutdown().await.unwrap();

    let h = h.after_crash();
    let service = h.start().await.unwrap();
    assert_eq!(register(&service, "A", 1).await, first);
    assert_eq!(register(&service, "B", 2).await, second);
    assert_eq!(register(&service, "C", 3).await, 3);
}

#[tokio::test]
async fn test_concurrent_registrations_get_distinct_ids() {
    let h = Harness::new();
    let service = Arc::new(h.start().await.unwrap());

    let tasks = (0..20).map(|i| {
        let service = service.clone();
        async move { register(&service, &format!("rm-{i}"), 0).await }
    });
    let ids: Vec<RecoveryId> = futures::future::join_all(tasks).await;

    let distinct: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 20);
    assert!(ids.iter().all(|id| (1..=20).contains(id)));
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_crash_after_decision_is_committed_by_recovery() {
    let h = Harness::new();
    let a = h.resource("A");
    let b = h.resource("B");
    let service = h.start().await.unwrap();
    let id_a = register(&service, "A", 10).await;
    let id_b = register(&service, "B", 5).await;
    b.set_hang_on_commit(true);

    let tm = service.manager().clone();
    let (res_a, res_b) = (as_xa(&a), as_xa(&b));
    let task = tokio::spawn(async move {
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0)?;
        tm.enlist(&ctx, res_a, id_a).await?;
        tm.enlist(&ctx, res_b, id_b).await?;
        tm.commit(&mut ctx).await
    });

    timeout(Duration::from_secs(5), async {
        while h.calls.count("B", Op::Commit) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();

    // A committed, B is still in doubt when the process dies
    assert!(a.in_doubt().is_empty());
    assert_eq!(b.in_doubt().len(), 1);
    b.set_hang_on_commit(false);

    let h = h.after_crash();
    let service = h.start().await.unwrap();

    assert!(b.in_doubt().is_empty());
    assert_eq!(h.calls.count("B", Op::Commit), 2);
    assert!(service.log().pending().is_empty());
    assert!(service.manager().heuristic_transactions().is_empty());
}

#[tokio::test]
async fn test_crash_before_decision_is_presumed_aborted() {
    let h = Harness::new();
    let a = h.resource("A");
    let service = h.start().await.unwrap();
    register(&service, "A", 0).await;

    let orphan = Xid::generate(99).branch(1);
    a.add_in_doubt(orphan.clone());

    let h = h.after_crash();
    let service = h.start().await.unwrap();
    assert!(a.in_doubt().is_empty());
    assert_eq!(h.calls_of(Op::Rollback), vec!["A"]);
    assert!(service.log().pending().is_empty());
}

fn pending_commit(global: &Xid) -> Vec<LogRecord> {
    vec![
        LogRecord::Partner(PartnerRecord {
            recovery_id: 1,
            factory: FACTORY.to_string(),
            info: b"A".to_vec(),
            priority: 0,
            written_at: now_millis(),
        }),
        LogRecord::Transaction(TransactionRecord {
            xid: global.clone(),
            state: LoggedState::Committing,
            decision: Decision::Commit,
            branches: vec![BranchRecord {
                recovery_id: Some(1),
                priority: 0,
                bqual: global.branch(1).bqual().to_vec(),
                resource_name: "A".to_string(),
                status: ResourceStatus::Prepared,
            }],
            written_at: now_millis(),
        }),
    ]
}

#[tokio::test]
async fn test_generic_factory_error_during_recovery_is_fatal() {
    let global = Xid::generate(5);
    let store = Arc::new(MemoryLogStore::with_records(&pending_commit(&global)).unwrap());
    let h = Harness::with_store(store);
    h.resource("A");
    h.factory.set_broken(true);

    let err = h.start().await.err().unwrap();
    assert!(matches!(err.as_transaction(), Some(TransactionError::Fatal(_))));
    assert_eq!(h.fatal.messages().len(), 1);
}

#[tokio::test]
async fn test_unavailable_resource_recovered_in_background() {
    let global = Xid::generate(5);
    let store = Arc::new(MemoryLogStore::with_records(&pending_commit(&global)).unwrap());
    let h = Harness::with_store(store);
    let a = h.resource("A");
    a.add_in_doubt(global.branch(1));
    h.factory.set_unavailable(2);

    let service = h.start().await.unwrap();
    assert_eq!(service.log().pending().len(), 1);

    timeout(Duration::from_secs(5), async {
        while !service.log().pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(a.in_doubt().is_empty());
    service.shutdown().await.unwrap();
}

// ============================================================================
// Heuristics
// ============================================================================

#[tokio::test]
async fn test_heuristic_outcome_reported_and_forgotten() {
    let h = Harness::new();
    let a = h.resource("A");
    let b = h.resource("B");
    let service = h.start().await.unwrap();
    let tm = service.manager();
    let id_a = register(&service, "A", 0).await;
    let id_b = register(&service, "B", 0).await;
    b.fail_next(Op::Commit, XaErrorCode::HeuristicRollback);

    let mut ctx = TxContext::new();
    let txn = tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&a), id_a).await.unwrap();
    tm.enlist(&ctx, as_xa(&b), id_b).await.unwrap();
    let err = tm.commit(&mut ctx).await.unwrap_err();
    assert!(matches!(
        err.as_transaction(),
        Some(TransactionError::Heuristic(HeuristicOutcome::Mixed))
    ));

    let reports = tm.heuristic_transactions();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, HeuristicOutcome::Mixed);
    let diverged: Vec<_> = reports[0].diverged().map(|b| b.resource_name.clone()).collect();
    assert_eq!(diverged, vec!["B"]);

    // survives a restart until forgotten
    let h = h.after_crash();
    let service = h.start().await.unwrap();
    let tm = service.manager();
    assert_eq!(tm.heuristic_transactions().len(), 1);

    assert!(tm.forget_heuristic(txn.xid()).await.unwrap());
    assert!(!tm.forget_heuristic(txn.xid()).await.unwrap());
    assert!(tm.heuristic_transactions().is_empty());
    assert_eq!(h.calls.count("B", Op::Forget), 2);

    let h = h.after_crash();
    let service = h.start().await.unwrap();
    assert!(service.manager().heuristic_transactions().is_empty());
}

/// Commit of A and B where B stops answering commit for the whole retry budget
async fn commit_with_silent_branch(
    h: &Harness,
    service: &TransactionService,
) -> (Xid, Arc<ScriptedResource>) {
    let a = h.resource("A");
    let b = h.resource("B");
    let id_a = register(service, "A", 10).await;
    let id_b = register(service, "B", 5).await;
    for _ in 0..service_retry_limit() {
        b.fail_next(Op::Commit, XaErrorCode::RmFail);
    }

    let tm = service.manager();
    let mut ctx = TxContext::new();
    let txn = tm.begin(&mut ctx, 0).unwrap();
    tm.enlist(&ctx, as_xa(&a), id_a).await.unwrap();
    tm.enlist(&ctx, as_xa(&b), id_b).await.unwrap();
    let err = tm.commit(&mut ctx).await.unwrap_err();
    assert!(matches!(
        err.as_transaction(),
        Some(TransactionError::Heuristic(HeuristicOutcome::Hazard))
    ));
    assert!(a.in_doubt().is_empty());
    assert_eq!(b.in_doubt().len(), 1);
    (txn.xid().clone(), b)
}

fn service_retry_limit() -> u32 {
    test_config().transaction.heuristic_retry_limit
}

#[tokio::test]
async fn test_forgetting_unacknowledged_commit_redrives_it() {
    let h = Harness::new();
    let mut config = test_config();
    config.recovery.confirmation_window_secs = 0;
    let service = h.start_with(&config).await.unwrap();
    let (xid, b) = commit_with_silent_branch(&h, &service).await;

    let reports = service.manager().heuristic_transactions();
    assert_eq!(reports.len(), 1);
    let unresolved: Vec<_> = reports[0].unresolved().map(|b| b.resource_name.clone()).collect();
    assert_eq!(unresolved, vec!["B"]);

    assert!(service.manager().forget_heuristic(&xid).await.unwrap());
    assert!(b.in_doubt().is_empty());
    assert!(service.manager().heuristic_transactions().is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    service.prune_log().await.unwrap();
    let report = service.recover().await.unwrap();

    assert_eq!(report.presumed_aborted, 0);
    assert_eq!(h.calls.count("B", Op::Commit), service_retry_limit() as usize + 1);
    assert_eq!(h.calls.count("B", Op::Rollback), 0);
    assert_eq!(h.calls.count("B", Op::Forget), 0);
    assert!(service.log().pending().is_empty());
}

#[tokio::test]
async fn test_unacknowledged_commit_survives_prune_and_restart() {
    let h = Harness::new();
    let mut config = test_config();
    config.recovery.confirmation_window_secs = 0;
    let service = h.start_with(&config).await.unwrap();
    let (_, b) = commit_with_silent_branch(&h, &service).await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    service.prune_log().await.unwrap();
    assert_eq!(service.log().pending().len(), 1);

    // the restarted service finishes the commit during startup recovery
    let h = h.after_crash();
    let service = h.start_with(&config).await.unwrap();
    assert!(b.in_doubt().is_empty());
    assert_eq!(h.calls.count("B", Op::Rollback), 0);
    assert!(service.log().pending().is_empty());
    assert!(service.manager().heuristic_transactions().is_empty());

    let report = service.recovery().recover_once().await.unwrap();
    assert!(report.is_resolved());
    assert_eq!(report.presumed_aborted, 0);
}
