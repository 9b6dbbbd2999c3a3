//! Two-phase commit coordinator
//!
//! Drives prepare and completion across a transaction's enlistments in
//! priority order, forces the commit decision to the recovery log before
//! phase 2, retries failing branches and reports heuristic outcomes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use tracing::{debug, error, info, warn};

use xacoord_common::config::TransactionConfig;
use xacoord_common::error::{Result, TransactionError};
use xacoord_common::metrics;
use xacoord_common::types::{
    now_millis, Decision, HeuristicOutcome, Priority, ResourceStatus, Xid,
};
use xacoord_log::{BranchRecord, LoggedState, TransactionLog, TransactionRecord};

use crate::enlistment::{BranchState, Enlistment, EnlistmentTable};
use crate::factory::FactoryAdapter;
use crate::journal::{HeuristicJournal, HeuristicReport};
use crate::registry::ResourceRegistry;
use crate::transaction::{Transaction, TxState};
use crate::xa::{EndFlag, Vote, XaErrorCode};

/// Combine branch statuses into the transaction's heuristic outcome
///
/// `None` means every branch agrees with `decision`.
pub fn combine_outcome(
    decision: Decision,
    statuses: impl IntoIterator<Item = ResourceStatus>,
) -> Option<HeuristicOutcome> {
    let (mut committed, mut rolled_back, mut mixed, mut hazard) = (false, false, false, false);
    for status in statuses {
        match status {
            ResourceStatus::Committed | ResourceStatus::HeuristicCommit => committed = true,
            ResourceStatus::RolledBack | ResourceStatus::HeuristicRollback => rolled_back = true,
            ResourceStatus::HeuristicMixed => mixed = true,
            ResourceStatus::HeuristicHazard => hazard = true,
            _ => {}
        }
    }

    if mixed || (committed && rolled_back) {
        Some(HeuristicOutcome::Mixed)
    } else if hazard {
        Some(HeuristicOutcome::Hazard)
    } else if decision == Decision::Commit && rolled_back {
        Some(HeuristicOutcome::Rollback)
    } else if decision == Decision::Rollback && committed {
        Some(HeuristicOutcome::Commit)
    } else {
        None
    }
}

/// Delay before completion pass `pass`, doubling every 10 passes
pub fn retry_delay(base_ms: u64, pass: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << (pass / 10).min(16)))
}

fn heuristic_status(code: XaErrorCode) -> Option<ResourceStatus> {
    match code {
        XaErrorCode::HeuristicCommit => Some(ResourceStatus::HeuristicCommit),
        XaErrorCode::HeuristicRollback => Some(ResourceStatus::HeuristicRollback),
        XaErrorCode::HeuristicMixed => Some(ResourceStatus::HeuristicMixed),
        XaErrorCode::HeuristicHazard => Some(ResourceStatus::HeuristicHazard),
        _ => None,
    }
}

enum PrepareOutcome {
    /// Every branch voted read-only
    ReadOnly,
    /// At least one branch voted OK
    Prepared,
    /// Commit this branch with a single one-phase call
    OnePhase(usize),
    Rollback { reason: String, system: bool },
}

enum Delivery {
    Done,
    Retry,
    System(String),
}

/// Drives transactions through two-phase commit
pub struct TwoPhaseCoordinator {
    config: TransactionConfig,
    log: Arc<TransactionLog>,
    registry: Arc<ResourceRegistry>,
    adapter: Arc<FactoryAdapter>,
    journal: Arc<HeuristicJournal>,
    /// Gtrids currently being completed by this process
    in_flight: DashSet<Vec<u8>>,
}

impl TwoPhaseCoordinator {
    pub fn new(
        config: TransactionConfig,
        log: Arc<TransactionLog>,
        registry: Arc<ResourceRegistry>,
        adapter: Arc<FactoryAdapter>,
        journal: Arc<HeuristicJournal>,
    ) -> Self {
        Self {
            config,
            log,
            registry,
            adapter,
            journal,
            in_flight: DashSet::new(),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Whether a transaction with this gtrid is being completed right now
    pub fn is_in_flight(&self, gtrid: &[u8]) -> bool {
        self.in_flight.contains(gtrid)
    }

    // ========================================================================
    // Commit and rollback
    // ========================================================================

    /// Commit a transaction
    pub async fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        let gtrid = txn.xid().gtrid().to_vec();
        self.in_flight.insert(gtrid.clone());
        let start = Instant::now();

        let result = self.commit_inner(txn).await;

        self.in_flight.remove(&gtrid);
        metrics::record_commit_latency(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Roll back a transaction
    pub async fn rollback(&self, txn: &Arc<Transaction>) -> Result<()> {
        let gtrid = txn.xid().gtrid().to_vec();
        self.in_flight.insert(gtrid.clone());

        let mut table = txn.enlistments.lock().await;
        self.end_associations(txn, &mut table).await;
        let result = self.rollback_table(txn, &mut table).await;
        drop(table);

        self.in_flight.remove(&gtrid);
        result
    }

    async fn commit_inner(&self, txn: &Arc<Transaction>) -> Result<()> {
        let mut table = txn.enlistments.lock().await;

        txn.check_expired();
        self.end_associations(txn, &mut table).await;

        if txn.is_rollback_only() {
            let reason = if txn.is_timed_out() {
                "transaction timed out"
            } else {
                "transaction marked rollback-only"
            };
            info!("Rolling back {} at commit: {}", txn.xid(), reason);
            self.rollback_table(txn, &mut table).await?;
            return Err(TransactionError::Rollback(reason.to_string()).into());
        }

        if table.is_empty() {
            return self.settle(txn, Decision::Commit, None, None);
        }

        txn.set_state(TxState::Preparing);
        match self.prepare(txn, &mut table).await {
            PrepareOutcome::ReadOnly => {
                debug!("All branches of {} voted read-only", txn.xid());
                let outcome = self.finish(txn.xid(), Decision::Commit, false, Vec::new(), &mut table).await;
                self.settle(txn, Decision::Commit, outcome, None)
            }
            PrepareOutcome::OnePhase(index) => self.commit_one_phase(txn, &mut table, index).await,
            PrepareOutcome::Rollback { reason, system } => {
                info!("Rolling back {}: {}", txn.xid(), reason);
                self.rollback_table(txn, &mut table).await?;
                Err(if system {
                    TransactionError::System(reason)
                } else {
                    TransactionError::Rollback(reason)
                }
                .into())
            }
            PrepareOutcome::Prepared => self.commit_prepared(txn, &mut table).await,
        }
    }

    /// End every live association before completion
    async fn end_associations(&self, txn: &Transaction, table: &mut EnlistmentTable) {
        for e in table.entries_mut() {
            if !matches!(e.state, BranchState::Active | BranchState::Suspended) {
                continue;
            }
            match e.resource.end(&e.xid, EndFlag::Success).await {
                Ok(()) => e.state = BranchState::Ended,
                Err(err) => {
                    warn!("End of {} on {} failed: {}", e.xid, e.name, err);
                    e.state = BranchState::Failed;
                    if err.code == XaErrorCode::Rollback {
                        e.status = ResourceStatus::RolledBack;
                    }
                    txn.set_rollback_only();
                }
            }
        }
    }

    async fn prepare(&self, txn: &Transaction, table: &mut EnlistmentTable) -> PrepareOutcome {
        let order = table.completion_order();
        let last_participant = table.one_phase_only();
        let last_two_phase = order
            .iter()
            .rev()
            .copied()
            .find(|&i| !table.entries()[i].one_phase_only);
        let mut voted_ok = 0usize;

        for &i in &order {
            if table.entries()[i].one_phase_only {
                continue;
            }
            if txn.is_rollback_only() {
                return PrepareOutcome::Rollback {
                    reason: "transaction marked rollback-only during prepare".to_string(),
                    system: false,
                };
            }

            let e = table.get_mut(i);
            if self.config.one_phase_optimization
                && voted_ok == 0
                && last_participant.is_none()
                && Some(i) == last_two_phase
                && e.resource.supports_one_phase()
            {
                return PrepareOutcome::OnePhase(i);
            }

            debug!("Preparing {} on {}", e.xid, e.name);
            match e.resource.prepare(&e.xid).await {
                Ok(Vote::Ok) => {
                    e.status = ResourceStatus::Prepared;
                    voted_ok += 1;
                }
                Ok(Vote::ReadOnly) => e.status = ResourceStatus::Completed,
                Err(err) => {
                    warn!("Prepare of {} on {} failed: {}", e.xid, e.name, err);
                    let system = match err.code {
                        XaErrorCode::Rollback | XaErrorCode::NotA => {
                            e.status = ResourceStatus::RolledBack;
                            false
                        }
                        code @ (XaErrorCode::HeuristicCommit
                        | XaErrorCode::HeuristicRollback
                        | XaErrorCode::HeuristicMixed
                        | XaErrorCode::HeuristicHazard) => {
                            e.status = heuristic_status(code).unwrap_or(ResourceStatus::HeuristicHazard);
                            false
                        }
                        // Branch state unknown; it still gets a rollback
                        XaErrorCode::RmFail => false,
                        XaErrorCode::RmErr
                        | XaErrorCode::Retry
                        | XaErrorCode::Inval
                        | XaErrorCode::Proto => true,
                    };
                    return PrepareOutcome::Rollback {
                        reason: format!("{} failed to prepare: {}", e.name, err),
                        system,
                    };
                }
            }
        }

        if voted_ok > 0 {
            PrepareOutcome::Prepared
        } else if let Some(index) = last_participant {
            PrepareOutcome::OnePhase(index)
        } else {
            PrepareOutcome::ReadOnly
        }
    }

    /// Commit a single voting branch without prepare
    async fn commit_one_phase(
        &self,
        txn: &Transaction,
        table: &mut EnlistmentTable,
        index: usize,
    ) -> Result<()> {
        txn.set_state(TxState::Committing);
        let e = table.get_mut(index);
        e.attempts += 1;
        debug!("Committing {} on {} in one phase", e.xid, e.name);

        let mut system = None;
        let decision = match e.resource.commit(&e.xid, true).await {
            Ok(()) => {
                e.status = ResourceStatus::Committed;
                Decision::Commit
            }
            Err(err) => {
                warn!("One-phase commit of {} on {} failed: {}", e.xid, e.name, err);
                match err.code {
                    XaErrorCode::Rollback | XaErrorCode::RmErr | XaErrorCode::NotA => {
                        e.status = ResourceStatus::RolledBack;
                        Decision::Rollback
                    }
                    code @ (XaErrorCode::HeuristicCommit
                    | XaErrorCode::HeuristicRollback
                    | XaErrorCode::HeuristicMixed) => {
                        e.status = heuristic_status(code).unwrap_or(ResourceStatus::HeuristicHazard);
                        Decision::Commit
                    }
                    XaErrorCode::HeuristicHazard | XaErrorCode::RmFail | XaErrorCode::Retry => {
                        e.status = ResourceStatus::HeuristicHazard;
                        Decision::Commit
                    }
                    XaErrorCode::Inval | XaErrorCode::Proto => {
                        e.status = ResourceStatus::Completed;
                        system = Some(format!("unexpected error from {}: {}", e.name, err));
                        Decision::Commit
                    }
                }
            }
        };

        let outcome = self.finish(txn.xid(), decision, false, Vec::new(), table).await;
        self.settle(txn, decision, outcome, system)?;
        if decision == Decision::Rollback {
            return Err(TransactionError::Rollback(
                "resource rolled back during one-phase commit".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Phase 2 after at least one branch voted OK
    async fn commit_prepared(&self, txn: &Transaction, table: &mut EnlistmentTable) -> Result<()> {
        txn.set_state(TxState::Prepared);

        let record = Self::decision_record(txn.xid(), LoggedState::Committing, Decision::Commit, table);
        if let Err(e) = self.log.log_transaction(record).await {
            error!("Failed to force commit decision for {}: {}", txn.xid(), e);
            self.rollback_table(txn, table).await?;
            return Err(TransactionError::Rollback(format!(
                "commit decision could not be logged: {e}"
            ))
            .into());
        }

        txn.set_state(TxState::Committing);
        let mut decision = Decision::Commit;

        if let Some(index) = table.one_phase_only() {
            if !self.commit_last_participant(table.get_mut(index)).await {
                decision = Decision::Rollback;
                txn.set_state(TxState::RollingBack);
                let record = Self::decision_record(txn.xid(), LoggedState::RollingBack, Decision::Rollback, table);
                if let Err(e) = self.log.log_transaction(record).await {
                    error!("Failed to force rollback decision for {}: {}", txn.xid(), e);
                }
            }
        }

        let system = self.drive(decision, table).await?;
        let outcome = self.finish(txn.xid(), decision, true, Vec::new(), table).await;
        self.settle(txn, decision, outcome, system)?;
        if decision == Decision::Rollback {
            return Err(TransactionError::Rollback(
                "last participant rolled back".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// One-phase commit of the last participant; false if it rolled back
    async fn commit_last_participant(&self, e: &mut Enlistment) -> bool {
        e.attempts += 1;
        debug!("Committing last participant {} on {}", e.xid, e.name);
        match e.resource.commit(&e.xid, true).await {
            Ok(()) => {
                e.status = ResourceStatus::Committed;
                true
            }
            Err(err) => {
                warn!("Last participant {} failed to commit {}: {}", e.name, e.xid, err);
                match err.code {
                    XaErrorCode::Rollback | XaErrorCode::RmErr | XaErrorCode::NotA => {
                        e.status = ResourceStatus::RolledBack;
                        false
                    }
                    code => {
                        e.status = heuristic_status(code).unwrap_or(ResourceStatus::HeuristicHazard);
                        true
                    }
                }
            }
        }
    }

    async fn rollback_table(&self, txn: &Transaction, table: &mut EnlistmentTable) -> Result<()> {
        txn.set_state(TxState::RollingBack);
        let system = self.drive(Decision::Rollback, table).await?;
        let outcome = self.finish(txn.xid(), Decision::Rollback, false, Vec::new(), table).await;
        self.settle(txn, Decision::Rollback, outcome, system)
    }

    /// Final transaction state, metrics and caller-visible result
    fn settle(
        &self,
        txn: &Transaction,
        decision: Decision,
        outcome: Option<HeuristicOutcome>,
        system: Option<String>,
    ) -> Result<()> {
        txn.cancel_timer();
        metrics::record_completion(decision, outcome);

        if let Some(kind) = outcome {
            txn.set_state(TxState::Heuristic(kind));
            return Err(TransactionError::Heuristic(kind).into());
        }
        txn.set_state(match decision {
            Decision::Commit => TxState::Committed,
            Decision::Rollback => TxState::RolledBack,
        });
        match system {
            Some(message) => Err(TransactionError::System(message).into()),
            None => Ok(()),
        }
    }

    fn decision_record(
        xid: &Xid,
        state: LoggedState,
        decision: Decision,
        table: &EnlistmentTable,
    ) -> TransactionRecord {
        TransactionRecord {
            xid: xid.clone(),
            state,
            decision,
            branches: table
                .to_records()
                .into_iter()
                .filter(|b| !b.status.is_terminal())
                .collect(),
            written_at: now_millis(),
        }
    }

    // ========================================================================
    // Completion delivery
    // ========================================================================

    /// Deliver `decision` to every unfinished branch, retrying failures
    ///
    /// Commit goes in priority order; while a branch needs a retry only
    /// branches of the same priority are tried in that pass. Rollback goes in
    /// enlistment order. A branch that runs out of retries stays
    /// `Completing` so the logged decision is re-driven by recovery. Returns a
    /// system error message if a resource reported a protocol error.
    async fn drive(&self, decision: Decision, table: &mut EnlistmentTable) -> Result<Option<String>> {
        let order: Vec<usize> = match decision {
            Decision::Commit => table.completion_order(),
            Decision::Rollback => (0..table.len()).collect(),
        };
        let mut given_up = vec![false; table.len()];
        let mut system = None;
        let mut pass = 0u32;

        loop {
            let mut blocked: Option<Priority> = None;
            let mut retry_pending = false;

            for &i in &order {
                let e = table.get_mut(i);
                if e.status.is_terminal() || given_up[i] {
                    continue;
                }
                if let Some(priority) = blocked {
                    if e.priority != priority {
                        break;
                    }
                }

                match self.deliver(e, decision).await? {
                    Delivery::Done => {}
                    Delivery::System(message) => system = Some(message),
                    Delivery::Retry => {
                        if self.retries_exhausted(e) {
                            error!(
                                "Giving up on {} for {} after {} attempts, leaving {} to recovery",
                                e.name, e.xid, e.attempts, decision
                            );
                            given_up[i] = true;
                        } else {
                            retry_pending = true;
                            if decision == Decision::Commit {
                                blocked = Some(e.priority);
                            }
                        }
                    }
                }
            }

            if !retry_pending {
                return Ok(system);
            }

            pass += 1;
            let delay = retry_delay(self.config.heuristic_retry_interval_ms, pass);
            debug!("Retrying {} completion in {:?} (pass {})", decision, delay, pass);
            tokio::time::sleep(delay).await;
        }
    }

    fn retries_exhausted(&self, e: &Enlistment) -> bool {
        let limit = self.config.heuristic_retry_limit;
        limit != 0 && e.attempts >= limit
    }

    async fn deliver(&self, e: &mut Enlistment, decision: Decision) -> Result<Delivery> {
        if e.needs_reconnect {
            if let Err(err) = self.reconnect(e).await {
                if !err.is_retryable() {
                    return Err(err);
                }
                e.attempts += 1;
                return Ok(Delivery::Retry);
            }
        }

        e.attempts += 1;
        let result = match decision {
            Decision::Commit => e.resource.commit(&e.xid, false).await,
            Decision::Rollback => e.resource.rollback(&e.xid).await,
        };
        let Err(err) = result else {
            e.status = match decision {
                Decision::Commit => ResourceStatus::Committed,
                Decision::Rollback => ResourceStatus::RolledBack,
            };
            return Ok(Delivery::Done);
        };

        warn!(
            "{} of {} on {} failed (attempt {}): {}",
            decision, e.xid, e.name, e.attempts, err
        );
        let retrying = e.attempts > 1 || e.recovered;

        let delivery = match err.code {
            code @ (XaErrorCode::HeuristicCommit
            | XaErrorCode::HeuristicRollback
            | XaErrorCode::HeuristicMixed
            | XaErrorCode::HeuristicHazard) => {
                e.status = heuristic_status(code).unwrap_or(ResourceStatus::HeuristicHazard);
                Delivery::Done
            }
            XaErrorCode::Rollback => {
                e.status = ResourceStatus::RolledBack;
                Delivery::Done
            }
            XaErrorCode::NotA => {
                e.status = match decision {
                    // Someone forgot a prepared branch; outcome unknown
                    Decision::Commit if !retrying => ResourceStatus::HeuristicHazard,
                    Decision::Commit => ResourceStatus::Completed,
                    Decision::Rollback => ResourceStatus::RolledBack,
                };
                Delivery::Done
            }
            // the resource manager has rolled the branch back
            XaErrorCode::RmErr => {
                if decision == Decision::Commit {
                    error!("{} rolled back {} instead of committing", e.name, e.xid);
                }
                e.status = ResourceStatus::RolledBack;
                Delivery::Done
            }
            XaErrorCode::RmFail
                if decision == Decision::Rollback && e.status == ResourceStatus::Registered =>
            {
                e.status = ResourceStatus::RolledBack;
                Delivery::Done
            }
            XaErrorCode::RmFail | XaErrorCode::Retry => {
                e.needs_reconnect = true;
                e.status = ResourceStatus::Completing;
                metrics::record_branch_retry(&e.name);
                Delivery::Retry
            }
            XaErrorCode::Inval | XaErrorCode::Proto => {
                e.status = ResourceStatus::Completed;
                Delivery::System(format!("unexpected error from {}: {}", e.name, err))
            }
        };
        Ok(delivery)
    }

    /// Swap in a fresh handle from the branch's factory
    ///
    /// Branches without a registration keep retrying on their current handle.
    async fn reconnect(&self, e: &mut Enlistment) -> Result<()> {
        let Some(partner) = e.recovery_id.and_then(|id| self.registry.lookup(id)) else {
            e.needs_reconnect = false;
            return Ok(());
        };

        let fresh = self.adapter.reconstruct(&partner).await?;
        let stale = std::mem::replace(&mut e.resource, fresh);
        if let Some(factory) = e.reconstructed_from.replace(partner.factory.clone()) {
            let _ = self.adapter.destroy(&factory, stale).await;
        }
        e.needs_reconnect = false;
        info!("Reconnected {} for {}", e.name, e.xid);
        Ok(())
    }

    /// Log the outcome, forget heuristic branches and release handles
    async fn finish(
        &self,
        xid: &Xid,
        decision: Decision,
        logged: bool,
        extra: Vec<BranchRecord>,
        table: &mut EnlistmentTable,
    ) -> Option<HeuristicOutcome> {
        let mut branches = table.to_records();
        branches.extend(extra);
        // a branch that never acknowledged the decision may have gone either way
        let outcome = combine_outcome(
            decision,
            branches.iter().map(|b| {
                if b.status.is_terminal() {
                    b.status
                } else {
                    ResourceStatus::HeuristicHazard
                }
            }),
        );

        if let Some(kind) = outcome {
            error!("Transaction {} completed with {} (decision {})", xid, kind, decision);
            self.forget_branches(table).await;

            let record = TransactionRecord {
                xid: xid.clone(),
                state: LoggedState::Heuristic(kind),
                decision,
                branches,
                written_at: now_millis(),
            };
            if let Some(report) = HeuristicReport::from_record(&record) {
                self.journal.record(report);
            }
            if let Err(e) = self.log.log_transaction(record).await {
                error!("Failed to log heuristic outcome of {}: {}", xid, e);
            }
        } else {
            self.journal.remove(xid.gtrid());
            if logged {
                if let Err(e) = self.log.log_completed(xid.gtrid()).await {
                    warn!("Failed to log completion of {}: {}", xid, e);
                }
            }
        }

        self.release(table).await;
        outcome
    }

    async fn forget_branches(&self, table: &EnlistmentTable) {
        for e in table.entries().iter().filter(|e| e.status.is_heuristic()) {
            match e.resource.forget(&e.xid).await {
                Ok(()) => debug!("Forgot heuristic branch {} on {}", e.xid, e.name),
                Err(err) if err.code == XaErrorCode::NotA => {}
                Err(err) => warn!("Forget of {} on {} failed: {}", e.xid, e.name, err),
            }
        }
    }

    async fn release(&self, table: &mut EnlistmentTable) {
        for (factory, resource) in table.take_reconstructed() {
            let _ = self.adapter.destroy(&factory, resource).await;
        }
    }

    // ========================================================================
    // Recovery and administration
    // ========================================================================

    /// Reconstruct the unfinished branches of a logged transaction
    ///
    /// Returns the rebuilt table and the branches that get no calls: those
    /// already terminal, plus branches whose outcome can no longer be learned,
    /// recorded as hazards. A factory error releases whatever was rebuilt.
    pub async fn rebuild(&self, record: &TransactionRecord) -> Result<(EnlistmentTable, Vec<BranchRecord>)> {
        let mut table = EnlistmentTable::new();
        let mut unreachable = Vec::new();

        for branch in &record.branches {
            if branch.status.is_terminal() {
                unreachable.push(branch.clone());
                continue;
            }
            // A last participant left unfinished under a commit decision may
            // or may not have committed
            if branch.status == ResourceStatus::Registered && record.decision == Decision::Commit {
                warn!(
                    "Outcome of last participant {} in {} is unknown",
                    branch.resource_name, record.xid
                );
                unreachable.push(hazard(branch));
                continue;
            }

            let Some(partner) = branch.recovery_id.and_then(|id| self.registry.lookup(id)) else {
                warn!(
                    "Branch {} of {} has no resource registration; its outcome is unknown",
                    branch.resource_name, record.xid
                );
                unreachable.push(hazard(branch));
                continue;
            };

            match self.adapter.reconstruct(&partner).await {
                Ok(resource) => {
                    table.add_recovered(resource, partner.factory.clone(), record.branch_xid(branch), branch);
                }
                Err(e) => {
                    self.release(&mut table).await;
                    return Err(e);
                }
            }
        }
        Ok((table, unreachable))
    }

    /// Re-drive a logged decision with reconstructed branches
    ///
    /// `unreachable` carries logged branches that could not be rebuilt; they
    /// count toward the outcome but receive no calls.
    pub async fn complete_recovered(
        &self,
        record: &TransactionRecord,
        mut table: EnlistmentTable,
        unreachable: Vec<BranchRecord>,
    ) -> Result<Option<HeuristicOutcome>> {
        let gtrid = record.gtrid().to_vec();
        if !self.in_flight.insert(gtrid.clone()) {
            self.release(&mut table).await;
            return Err(TransactionError::IllegalState(format!(
                "{} is already being completed",
                record.xid
            ))
            .into());
        }

        info!(
            "Recovering {}: {} of {} branches",
            record.xid,
            record.decision,
            table.len()
        );
        let system = match self.drive(record.decision, &mut table).await {
            Ok(system) => system,
            Err(e) => {
                self.release(&mut table).await;
                self.in_flight.remove(&gtrid);
                return Err(e);
            }
        };
        if let Some(message) = system {
            warn!("Recovery of {} hit a protocol error: {}", record.xid, message);
        }

        let outcome = self
            .finish(&record.xid, record.decision, true, unreachable, &mut table)
            .await;
        metrics::record_recovered_completion(record.decision, outcome);
        self.in_flight.remove(&gtrid);
        Ok(outcome)
    }

    /// Send `forget` to the diverged branches of a heuristic transaction and
    /// drop it from the journal; false if the transaction is unknown
    ///
    /// Branches that never acknowledged the decision are driven again first.
    /// If any still does not, the transaction stays in the journal and the
    /// call fails with `System`.
    pub async fn forget_heuristic(&self, xid: &Xid) -> Result<bool> {
        let Some(mut report) = self.journal.get(xid.gtrid()) else {
            return Ok(false);
        };

        if report.unresolved().next().is_some() {
            let record = self.log.transaction(xid.gtrid()).ok_or_else(|| {
                TransactionError::IllegalState(format!("no logged decision for {}", report.xid))
            })?;
            let (table, unreachable) = self.rebuild(&record).await?;
            self.complete_recovered(&record, table, unreachable).await?;

            match self.journal.get(xid.gtrid()) {
                None => {
                    info!("{} completed once its decision was re-driven", report.xid);
                    return Ok(true);
                }
                Some(latest) if latest.unresolved().next().is_some() => {
                    return Err(TransactionError::System(format!(
                        "{} still has branches awaiting {}; left for recovery",
                        latest.xid, latest.decision
                    ))
                    .into());
                }
                Some(latest) => report = latest,
            }
        }

        for branch in report.diverged() {
            let Some(partner) = branch.recovery_id.and_then(|id| self.registry.lookup(id)) else {
                warn!(
                    "Branch {} of {} has no registration, cannot forget it",
                    branch.resource_name, report.xid
                );
                continue;
            };
            let resource = self.adapter.reconstruct(&partner).await?;
            let branch_xid = report.xid.with_bqual(branch.bqual.clone());
            let result = resource.forget(&branch_xid).await;
            let _ = self.adapter.destroy(&partner.factory, resource).await;
            match result {
                Ok(()) => {}
                Err(err) if err.code == XaErrorCode::NotA => {}
                Err(err) => {
                    return Err(TransactionError::System(format!(
                        "forget of {} on {} failed: {}",
                        branch_xid, branch.resource_name, err
                    ))
                    .into())
                }
            }
        }

        self.log.log_forgotten(xid.gtrid()).await?;
        self.journal.remove(xid.gtrid());
        info!("Forgot heuristic transaction {}", report.xid);
        Ok(true)
    }
}

fn hazard(branch: &BranchRecord) -> BranchRecord {
    BranchRecord {
        status: ResourceStatus::HeuristicHazard,
        ..branch.clone()
    }
}
