//! Transaction service lifecycle
//!
//! Wires the recovery log, registry, coordinator, recovery manager and
//! transaction manager together, runs startup recovery and owns the
//! background recovery task.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use xacoord_common::config::Config;
use xacoord_common::error::{Result, TransactionError};
use xacoord_log::{FileLogStore, LogStore, PruneStats, TransactionLog};

use crate::coordinator::TwoPhaseCoordinator;
use crate::factory::{FactoryAdapter, FactoryRegistry};
use crate::fatal::FatalErrorHandler;
use crate::journal::HeuristicJournal;
use crate::manager::TransactionManager;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::registry::ResourceRegistry;

/// A running transaction service
pub struct TransactionService {
    config: Config,
    log: Arc<TransactionLog>,
    manager: Arc<TransactionManager>,
    recovery: Arc<RecoveryManager>,
    shutdown_tx: watch::Sender<bool>,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TransactionService {
    /// Start the service on the file-backed log configured in `config`
    pub async fn open(
        config: &Config,
        factories: Arc<FactoryRegistry>,
        fatal: Arc<dyn FatalErrorHandler>,
    ) -> Result<Self> {
        let store = FileLogStore::open(Path::new(&config.log.dir), config.log.max_segment_bytes).await?;
        Self::start(config, Arc::new(store), factories, fatal).await
    }

    /// Start the service on any log store
    ///
    /// Factories needed to recover logged transactions should be registered
    /// before this is called; a missing factory leaves its transactions to
    /// the background recovery task.
    pub async fn start(
        config: &Config,
        store: Arc<dyn LogStore>,
        factories: Arc<FactoryRegistry>,
        fatal: Arc<dyn FatalErrorHandler>,
    ) -> Result<Self> {
        config.validate()?;

        let log = Arc::new(TransactionLog::open(store).await?);
        let registry = Arc::new(ResourceRegistry::new(log.clone()));
        let adapter = Arc::new(FactoryAdapter::new(factories, fatal));
        let journal = Arc::new(HeuristicJournal::new());
        let coordinator = Arc::new(TwoPhaseCoordinator::new(
            config.transaction.clone(),
            log.clone(),
            registry.clone(),
            adapter.clone(),
            journal.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            log.clone(),
            registry.clone(),
            adapter.clone(),
            coordinator.clone(),
            journal.clone(),
            config.recovery.clone(),
        ));
        let manager = Arc::new(TransactionManager::new(
            config.transaction.clone(),
            coordinator,
            registry.clone(),
            journal,
        ));

        let missing = missing_factories(&registry, &adapter);
        if !missing.is_empty() {
            warn!(
                "No factory registered for logged resources of {:?} (registered: {:?}); their branches wait for background recovery",
                missing,
                adapter.factories().names()
            );
        }

        let (shutdown_tx, _) = watch::channel(false);
        let service = Self {
            config: config.clone(),
            log,
            manager,
            recovery,
            shutdown_tx,
            recovery_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        };

        if config.recovery.recover_on_startup {
            let report = service.recovery.recover_once().await?;
            if !report.is_resolved() {
                warn!(
                    "Startup recovery left {} transactions and {} resources outstanding",
                    report.outstanding, report.unavailable
                );
                service.spawn_recovery();
            }
        }

        info!("Transaction service started (log {})", config.log.dir);
        Ok(service)
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }

    /// Run one recovery pass now
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.recovery.recover_once().await
    }

    /// Start background recovery unless it is already running
    pub fn spawn_recovery(&self) {
        let mut task = self.recovery_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let recovery = Arc::clone(&self.recovery);
        *task = Some(tokio::spawn(recovery.run(self.shutdown_tx.subscribe())));
    }

    /// Drop completion markers older than the confirmation window
    pub async fn prune_log(&self) -> Result<PruneStats> {
        let window = Duration::from_secs(self.config.recovery.confirmation_window_secs);
        self.log.prune(window).await
    }

    /// Stop recovery, refuse new transactions and close the log
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(TransactionError::IllegalState("service already shut down".to_string()).into());
        }

        let _ = self.shutdown_tx.send(true);
        let task = self.recovery_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Recovery task failed: {}", e);
            }
        }

        let running = self.manager.shutdown();
        if running > 0 {
            warn!("{} transactions were still active at shutdown", running);
        }
        self.log.close().await?;
        info!("Transaction service stopped");
        Ok(())
    }
}

/// Factory names recorded in the log that nothing is registered under
fn missing_factories(registry: &ResourceRegistry, adapter: &FactoryAdapter) -> Vec<String> {
    let mut missing: Vec<String> = registry
        .registrations()
        .into_iter()
        .map(|p| p.factory)
        .filter(|name| !adapter.factories().contains(name))
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TxContext;
    use crate::testing::{CallLog, RecordingFatalHandler, ScriptedFactory, ScriptedResource};
    use xacoord_log::MemoryLogStore;

    #[tokio::test]
    async fn test_file_backed_service_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.log.dir = dir.path().join("tranlog").to_string_lossy().into_owned();

        let service = TransactionService::open(
            &config,
            Arc::new(FactoryRegistry::new()),
            Arc::new(RecordingFatalHandler::default()),
        )
        .await
        .unwrap();

        let calls = CallLog::new();
        let tm = service.manager();
        let mut ctx = TxContext::new();
        tm.begin(&mut ctx, 0).unwrap();
        tm.enlist(&ctx, ScriptedResource::new("a", &calls), 0).await.unwrap();
        tm.enlist(&ctx, ScriptedResource::new("b", &calls), 0).await.unwrap();
        tm.commit(&mut ctx).await.unwrap();

        assert!(service.log().pending().is_empty());
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_logged_factories_without_registration_are_listed() {
        let log = Arc::new(TransactionLog::open(Arc::new(MemoryLogStore::new())).await.unwrap());
        let registry = ResourceRegistry::new(log);
        registry.register("orders", b"cfg1", 0).await.unwrap();
        registry.register("ledger", b"cfg2", 0).await.unwrap();
        registry.register("ledger", b"cfg3", 0).await.unwrap();

        let factories = Arc::new(FactoryRegistry::new());
        factories.register("orders", ScriptedFactory::new());
        let adapter = FactoryAdapter::new(factories, Arc::new(RecordingFatalHandler::default()));

        assert_eq!(missing_factories(&registry, &adapter), vec!["ledger".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_illegal() {
        let service = TransactionService::start(
            &Config::default(),
            Arc::new(MemoryLogStore::new()),
            Arc::new(FactoryRegistry::new()),
            Arc::new(RecordingFatalHandler::default()),
        )
        .await
        .unwrap();

        service.shutdown().await.unwrap();
        let err = service.shutdown().await.unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::IllegalState(_))));

        let err = service.manager().begin(&mut TxContext::new(), 0).unwrap_err();
        assert!(matches!(err.as_transaction(), Some(TransactionError::System(_))));
    }
}
