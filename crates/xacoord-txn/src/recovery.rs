//! Crash recovery
//!
//! A recovery pass re-drives every logged decision that has not completed,
//! then asks each registered resource manager for its in-doubt branches and
//! rolls back those this coordinator has no decision for (presumed abort).
//! Passes repeat in the background until nothing is left outstanding.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use xacoord_common::config::RecoveryConfig;
use xacoord_common::error::{Result, TransactionError};
use xacoord_common::metrics;
use xacoord_common::types::HeuristicOutcome;
use xacoord_log::{PartnerRecord, TransactionLog, TransactionRecord};

use crate::coordinator::{retry_delay, TwoPhaseCoordinator};
use crate::factory::FactoryAdapter;
use crate::journal::HeuristicJournal;
use crate::registry::ResourceRegistry;
use crate::xa::{XaErrorCode, XaResource};

/// What one recovery pass achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Logged transactions found pending
    pub redriven: usize,
    /// Re-driven to completion without divergence
    pub resolved: usize,
    /// Re-driven to a heuristic outcome
    pub heuristic: usize,
    /// In-doubt branches rolled back because nothing was logged for them
    pub presumed_aborted: usize,
    /// Transactions or branches left for a later pass
    pub outstanding: usize,
    /// Registered resource managers that could not be reached
    pub unavailable: usize,
}

impl RecoveryReport {
    /// Nothing left for another pass to do
    pub fn is_resolved(&self) -> bool {
        self.outstanding == 0 && self.unavailable == 0
    }
}

enum Redrive {
    Deferred,
    Completed(Option<HeuristicOutcome>),
}

/// Runs recovery passes against the log and the registered resources
pub struct RecoveryManager {
    log: Arc<TransactionLog>,
    registry: Arc<ResourceRegistry>,
    adapter: Arc<FactoryAdapter>,
    coordinator: Arc<TwoPhaseCoordinator>,
    journal: Arc<HeuristicJournal>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<TransactionLog>,
        registry: Arc<ResourceRegistry>,
        adapter: Arc<FactoryAdapter>,
        coordinator: Arc<TwoPhaseCoordinator>,
        journal: Arc<HeuristicJournal>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            log,
            registry,
            adapter,
            coordinator,
            journal,
            config,
        }
    }

    /// Run a single recovery pass
    ///
    /// Fails only when a factory error is fatal; unavailable resources are
    /// counted in the report and retried by the next pass.
    pub async fn recover_once(&self) -> Result<RecoveryReport> {
        let _timer = metrics::LatencyTimer::new("xacoord_recovery_pass_duration_ms");
        let mut report = RecoveryReport::default();

        let loaded = self.journal.load(self.log.heuristics().iter());
        if loaded > 0 {
            warn!("{} transactions completed heuristically and await forget", loaded);
        }

        for record in self.log.pending() {
            if self.coordinator.is_in_flight(record.gtrid()) {
                continue;
            }
            report.redriven += 1;
            match self.redrive(&record).await? {
                Redrive::Deferred => report.outstanding += 1,
                Redrive::Completed(None) => report.resolved += 1,
                Redrive::Completed(Some(_)) => report.heuristic += 1,
            }
        }

        for partner in self.registry.registrations() {
            self.presume_abort(&partner, &mut report).await?;
        }

        metrics::record_recovery_pass(
            (report.resolved + report.heuristic + report.presumed_aborted) as u64,
            (report.outstanding + report.unavailable) as u64,
        );
        info!(
            "Recovery pass: {} re-driven, {} resolved, {} heuristic, {} presumed aborted, {} outstanding, {} unavailable",
            report.redriven,
            report.resolved,
            report.heuristic,
            report.presumed_aborted,
            report.outstanding,
            report.unavailable
        );
        Ok(report)
    }

    /// Rebuild a logged transaction's branches and drive its decision
    async fn redrive(&self, record: &TransactionRecord) -> Result<Redrive> {
        let (table, unreachable) = match self.coordinator.rebuild(record).await {
            Ok(rebuilt) => rebuilt,
            Err(e) if e.is_retryable() => {
                info!("Deferring recovery of {}: {}", record.xid, e);
                return Ok(Redrive::Deferred);
            }
            Err(e) => return Err(e),
        };

        match self.coordinator.complete_recovered(record, table, unreachable).await {
            Ok(_) if self.log.transaction(record.gtrid()).is_some_and(|t| t.is_pending()) => {
                info!("{} still has branches awaiting {}", record.xid, record.decision);
                Ok(Redrive::Deferred)
            }
            Ok(outcome) => Ok(Redrive::Completed(outcome)),
            Err(e) if matches!(e.as_transaction(), Some(TransactionError::IllegalState(_))) => {
                debug!("{} is being completed elsewhere", record.xid);
                Ok(Redrive::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// Roll back in-doubt branches of one resource manager that have no
    /// logged decision
    async fn presume_abort(&self, partner: &PartnerRecord, report: &mut RecoveryReport) -> Result<()> {
        let resource = match self.adapter.reconstruct(partner).await {
            Ok(resource) => resource,
            Err(e) if e.is_retryable() => {
                info!("Resource with recovery id {} unavailable: {}", partner.recovery_id, e);
                report.unavailable += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.roll_back_unknown(resource.as_ref(), partner, report).await;
        let _ = self.adapter.destroy(&partner.factory, resource).await;
        Ok(())
    }

    async fn roll_back_unknown(
        &self,
        resource: &dyn XaResource,
        partner: &PartnerRecord,
        report: &mut RecoveryReport,
    ) {
        let xids = match resource.recover().await {
            Ok(xids) => xids,
            Err(e) => {
                warn!("Recover on recovery id {} failed: {}", partner.recovery_id, e);
                report.unavailable += 1;
                return;
            }
        };

        for xid in xids {
            let gtrid = xid.gtrid();
            if !xid.is_ours()
                || self.coordinator.is_in_flight(gtrid)
                || self.log.transaction(gtrid).is_some()
                || self.log.is_completed(gtrid)
            {
                continue;
            }

            info!("No decision logged for in-doubt branch {}, rolling back", xid);
            match resource.rollback(&xid).await {
                Ok(()) => {}
                Err(e) if e.code == XaErrorCode::NotA => {}
                Err(e) => {
                    warn!("Presumed-abort rollback of {} failed: {}", xid, e);
                    report.outstanding += 1;
                    continue;
                }
            }
            metrics::record_presumed_abort();
            report.presumed_aborted += 1;
        }
    }

    /// Repeat recovery passes until everything is resolved or `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.recover_once().await {
                Ok(report) if report.is_resolved() => {
                    info!("Recovery complete after {} retries", attempt);
                    return;
                }
                Ok(_) => {}
                Err(e) if matches!(e.as_transaction(), Some(TransactionError::Fatal(_))) => {
                    error!("Recovery stopped: {}", e);
                    return;
                }
                Err(e) => warn!("Recovery pass failed: {}", e),
            }

            attempt += 1;
            let delay = retry_delay(self.config.retry_interval_ms, attempt);
            debug!("Next recovery pass in {:?}", delay);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("Recovery interrupted by shutdown");
                    return;
                }
            }
        }
    }
}
