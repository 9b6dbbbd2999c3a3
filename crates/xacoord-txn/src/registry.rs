//! Resource-info registrations and their recovery ids

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use xacoord_common::error::{Result, TransactionError};
use xacoord_common::types::{now_millis, Priority, RecoveryId};
use xacoord_log::{PartnerRecord, TransactionLog};

/// Maps recovery ids to `(factory, info, priority)` registrations
///
/// A registration is logged and forced before its id is handed out, so ids
/// stay valid across restarts.
pub struct ResourceRegistry {
    log: Arc<TransactionLog>,
    /// Next id to hand out; the lock also serializes registrations
    next_id: Mutex<RecoveryId>,
}

impl ResourceRegistry {
    pub fn new(log: Arc<TransactionLog>) -> Self {
        let next_id = log.max_recovery_id() + 1;
        Self {
            log,
            next_id: Mutex::new(next_id),
        }
    }

    /// Register resource info, returning its recovery id
    ///
    /// An identical registration returns the id it already has.
    pub async fn register(&self, factory: &str, info: &[u8], priority: Priority) -> Result<RecoveryId> {
        if factory.is_empty() {
            return Err(TransactionError::IllegalState("factory name is empty".to_string()).into());
        }

        let mut next_id = self.next_id.lock().await;

        if let Some(existing) = self
            .log
            .partners()
            .into_iter()
            .find(|p| p.matches(factory, info, priority))
        {
            return Ok(existing.recovery_id);
        }

        let recovery_id = *next_id;
        self.log
            .log_partner(PartnerRecord {
                recovery_id,
                factory: factory.to_string(),
                info: info.to_vec(),
                priority,
                written_at: now_millis(),
            })
            .await?;
        *next_id += 1;

        info!(
            "Registered resource info for factory {} with recovery id {} (priority {})",
            factory, recovery_id, priority
        );
        Ok(recovery_id)
    }

    pub fn lookup(&self, recovery_id: RecoveryId) -> Option<PartnerRecord> {
        self.log.partner(recovery_id)
    }

    /// All registrations in recovery id order
    pub fn registrations(&self) -> Vec<PartnerRecord> {
        self.log.partners()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xacoord_log::MemoryLogStore;

    #[tokio::test]
    async fn test_ids_are_distinct_and_deduplicated() {
        let log = Arc::new(TransactionLog::open(Arc::new(MemoryLogStore::new())).await.unwrap());
        let registry = ResourceRegistry::new(log);

        let a = registry.register("FactoryA", b"cfgA", 10).await.unwrap();
        let b = registry.register("FactoryB", b"cfgB", 5).await.unwrap();
        let c = registry.register("FactoryA", b"cfgA", 0).await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(registry.register("FactoryA", b"cfgA", 10).await.unwrap(), a);

        let partner = registry.lookup(b).unwrap();
        assert_eq!(partner.factory, "FactoryB");
        assert_eq!(partner.info, b"cfgB");
        assert_eq!(partner.priority, 5);
    }

    #[tokio::test]
    async fn test_ids_continue_after_restart() {
        let store = Arc::new(MemoryLogStore::new());
        {
            let log = Arc::new(TransactionLog::open(store.clone()).await.unwrap());
            let registry = ResourceRegistry::new(log);
            registry.register("f", b"one", 0).await.unwrap();
            registry.register("f", b"two", 0).await.unwrap();
        }

        let log = Arc::new(TransactionLog::open(Arc::new(store.crash_image())).await.unwrap());
        let registry = ResourceRegistry::new(log);
        assert_eq!(registry.lookup(2).unwrap().info, b"two");
        assert_eq!(registry.register("f", b"three", 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_consumes_no_id() {
        let store = Arc::new(MemoryLogStore::new());
        let log = Arc::new(TransactionLog::open(store.clone()).await.unwrap());
        let registry = ResourceRegistry::new(log);

        store.set_fail_writes(true);
        assert!(registry.register("f", b"x", 0).await.is_err());
        store.set_fail_writes(false);
        assert_eq!(registry.register("f", b"x", 0).await.unwrap(), 1);
        assert!(registry.lookup(2).is_none());
    }
}
