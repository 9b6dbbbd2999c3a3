//! Resource factories and the adapter that reconstructs handles from them

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use xacoord_common::error::{Result, TransactionError};
use xacoord_log::PartnerRecord;

use crate::fatal::FatalErrorHandler;
use crate::xa::XaResource;

/// Failure from `XaResourceFactory::get_xa_resource`
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// Transient; the coordinator retries later
    #[error("resource not available: {0}")]
    NotAvailable(String),

    #[error("{0}")]
    Other(String),
}

/// Failure from `XaResourceFactory::destroy_xa_resource`
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DestroyError(pub String);

/// Produces resource-manager handles from opaque registration info
#[async_trait]
pub trait XaResourceFactory: Send + Sync {
    async fn get_xa_resource(&self, info: &[u8]) -> std::result::Result<Arc<dyn XaResource>, FactoryError>;

    async fn destroy_xa_resource(&self, resource: Arc<dyn XaResource>) -> std::result::Result<(), DestroyError>;
}

/// Factories by registration name, wired once at startup
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, Arc<dyn XaResourceFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one under `name`
    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn XaResourceFactory>) {
        let name = name.into();
        debug!("Registering XA resource factory {}", name);
        self.factories.insert(name, factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn XaResourceFactory>> {
        self.factories.get(name).map(|f| Arc::clone(f.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }
}

/// Turns factory outcomes into coordinator errors
pub struct FactoryAdapter {
    factories: Arc<FactoryRegistry>,
    fatal: Arc<dyn FatalErrorHandler>,
}

impl FactoryAdapter {
    pub fn new(factories: Arc<FactoryRegistry>, fatal: Arc<dyn FatalErrorHandler>) -> Self {
        Self { factories, fatal }
    }

    pub fn factories(&self) -> &Arc<FactoryRegistry> {
        &self.factories
    }

    /// Build a live handle for a registered resource
    ///
    /// `NotAvailable` and a factory that is not (yet) registered map to
    /// `ResourceUnavailable`; any other factory error goes to the fatal
    /// handler and comes back as `Fatal`.
    pub async fn reconstruct(&self, partner: &PartnerRecord) -> Result<Arc<dyn XaResource>> {
        let Some(factory) = self.factories.get(&partner.factory) else {
            warn!(
                "No XA resource factory registered as {} (recovery id {})",
                partner.factory, partner.recovery_id
            );
            return Err(TransactionError::ResourceUnavailable(format!(
                "factory {} not registered",
                partner.factory
            ))
            .into());
        };

        match factory.get_xa_resource(&partner.info).await {
            Ok(resource) => {
                debug!(
                    "Reconstructed {} from recovery id {}",
                    resource.resource_name(),
                    partner.recovery_id
                );
                Ok(resource)
            }
            Err(FactoryError::NotAvailable(reason)) => {
                debug!(
                    "Resource for recovery id {} unavailable: {}",
                    partner.recovery_id, reason
                );
                Err(TransactionError::ResourceUnavailable(reason).into())
            }
            Err(FactoryError::Other(reason)) => {
                let message = format!(
                    "factory {} failed for recovery id {}: {}",
                    partner.factory, partner.recovery_id, reason
                );
                self.fatal.on_fatal(&message);
                Err(TransactionError::Fatal(message).into())
            }
        }
    }

    /// Release a handle obtained from `reconstruct`
    pub async fn destroy(&self, factory_name: &str, resource: Arc<dyn XaResource>) -> Result<()> {
        let Some(factory) = self.factories.get(factory_name) else {
            return Ok(());
        };
        let name = resource.resource_name();
        factory.destroy_xa_resource(resource).await.map_err(|e| {
            warn!("Failed to destroy XA resource {}: {}", name, e);
            TransactionError::DestroyFailed(e.to_string()).into()
        })
    }
}
