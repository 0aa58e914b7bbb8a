//! Store collaborators
//!
//! The service never talks to a database directly. Each concern it persists
//! or reads sits behind one of these traits; [`memory`] provides in-process
//! implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::event::CreateEvent;
use crate::model::{
    AppInstance, ApplicationQuery, ApplicationRecord, ClientMetrics, ClientRegistration,
    FeatureSummary, InstanceSighting, StrategySummary,
};

pub mod memory;

/// Raw metrics as reported, fanned out to subscribers on insert. Delivery
/// never drops a payload: each subscriber gets its own unbounded queue.
#[async_trait]
pub trait ClientMetricsStore: Send + Sync {
    async fn insert(&self, metrics: ClientMetrics) -> Result<(), StoreError>;

    /// Receive every payload inserted after this call.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientMetrics>;
}

#[async_trait]
pub trait ClientApplicationStore: Send + Sync {
    /// Insert or refresh one application per registration.
    async fn bulk_upsert(&self, apps: &[ClientRegistration]) -> Result<(), StoreError>;

    async fn upsert(&self, app: ApplicationRecord) -> Result<(), StoreError>;

    /// Flag every not-yet-announced application as announced and return them.
    async fn set_unannounced_to_announced(&self) -> Result<Vec<ApplicationRecord>, StoreError>;

    async fn get_applications(
        &self,
        query: &ApplicationQuery,
    ) -> Result<Vec<ApplicationRecord>, StoreError>;

    async fn get_application(&self, app_name: &str)
    -> Result<Option<ApplicationRecord>, StoreError>;

    async fn delete_application(&self, app_name: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ClientInstanceStore: Send + Sync {
    async fn bulk_upsert(&self, instances: &[ClientRegistration]) -> Result<(), StoreError>;

    async fn insert(&self, sighting: InstanceSighting) -> Result<(), StoreError>;

    async fn get_by_app_name(&self, app_name: &str) -> Result<Vec<AppInstance>, StoreError>;

    async fn delete_for_application(&self, app_name: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn batch_store(&self, events: Vec<CreateEvent>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FeatureToggleStore: Send + Sync {
    /// Stamp the named toggles as seen now.
    async fn last_seen_toggles(&self, names: &[String]) -> Result<(), StoreError>;

    async fn get_features(&self) -> Result<Vec<FeatureSummary>, StoreError>;
}

#[async_trait]
pub trait StrategyStore: Send + Sync {
    async fn get_strategies(&self) -> Result<Vec<StrategySummary>, StoreError>;
}

/// Every collaborator the metrics service uses.
#[derive(Clone)]
pub struct Stores {
    pub client_metrics: Arc<dyn ClientMetricsStore>,
    pub client_applications: Arc<dyn ClientApplicationStore>,
    pub client_instances: Arc<dyn ClientInstanceStore>,
    pub events: Arc<dyn EventStore>,
    pub feature_toggles: Arc<dyn FeatureToggleStore>,
    pub strategies: Arc<dyn StrategyStore>,
}
