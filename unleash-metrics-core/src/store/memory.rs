//! In-process store implementations
//!
//! Used by the CLI and by tests. Each store keeps a log of the batches it
//! received and can be told to fail, so callers can observe exactly what the
//! service sent and how it copes with a broken collaborator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use super::{
    ClientApplicationStore, ClientInstanceStore, ClientMetricsStore, EventStore,
    FeatureToggleStore, Stores, StrategyStore,
};
use crate::error::StoreError;
use crate::event::{CreateEvent, StoredEvent};
use crate::lock;
use crate::model::{
    AppInstance, ApplicationQuery, ApplicationRecord, ClientMetrics, ClientRegistration,
    FeatureSummary, InstanceSighting, StrategySummary,
};

/// Injected failure shared by the memory stores.
#[derive(Debug, Default)]
struct Failure {
    message: Mutex<Option<String>>,
}

impl Failure {
    fn set(&self, message: Option<&str>) {
        *lock(&self.message) = message.map(str::to_string);
    }

    fn check(&self, store: &'static str) -> Result<(), StoreError> {
        match lock(&self.message).as_ref() {
            Some(message) => Err(StoreError::Unavailable {
                store,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Client metrics
// ============================================================================

#[derive(Debug)]
pub struct MemoryClientMetricsStore {
    inserted: Mutex<Vec<ClientMetrics>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ClientMetrics>>>,
    failure: Failure,
}

impl MemoryClientMetricsStore {
    pub fn new() -> Self {
        Self {
            inserted: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            failure: Failure::default(),
        }
    }

    /// Subscribers whose receiver is still alive.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    pub fn inserted(&self) -> Vec<ClientMetrics> {
        lock(&self.inserted).clone()
    }

    pub fn fail_with(&self, message: Option<&str>) {
        self.failure.set(message);
    }
}

impl Default for MemoryClientMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientMetricsStore for MemoryClientMetricsStore {
    async fn insert(&self, metrics: ClientMetrics) -> Result<(), StoreError> {
        self.failure.check("client-metrics")?;
        lock(&self.inserted).push(metrics.clone());
        // A failed send means the receiver is gone
        lock(&self.subscribers).retain(|tx| tx.send(metrics.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientMetrics> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

// ============================================================================
// Client applications
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryApplicationStore {
    apps: Mutex<BTreeMap<String, ApplicationRecord>>,
    bulk_batches: Mutex<Vec<Vec<ClientRegistration>>>,
    failure: Failure,
}

impl MemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch passed to `bulk_upsert`, in call order.
    pub fn bulk_batches(&self) -> Vec<Vec<ClientRegistration>> {
        lock(&self.bulk_batches).clone()
    }

    pub fn applications(&self) -> Vec<ApplicationRecord> {
        lock(&self.apps).values().cloned().collect()
    }

    pub fn fail_with(&self, message: Option<&str>) {
        self.failure.set(message);
    }

    fn merge(apps: &mut BTreeMap<String, ApplicationRecord>, incoming: ApplicationRecord) {
        match apps.get_mut(&incoming.app_name) {
            Some(existing) => {
                if incoming.description.is_some() {
                    existing.description = incoming.description;
                }
                if incoming.url.is_some() {
                    existing.url = incoming.url;
                }
                if incoming.color.is_some() {
                    existing.color = incoming.color;
                }
                if incoming.icon.is_some() {
                    existing.icon = incoming.icon;
                }
                if !incoming.strategies.is_empty() {
                    existing.strategies = incoming.strategies;
                }
            }
            None => {
                let mut record = incoming;
                record.created_at.get_or_insert_with(Utc::now);
                record.announced = false;
                apps.insert(record.app_name.clone(), record);
            }
        }
    }
}

#[async_trait]
impl ClientApplicationStore for MemoryApplicationStore {
    async fn bulk_upsert(&self, apps: &[ClientRegistration]) -> Result<(), StoreError> {
        lock(&self.bulk_batches).push(apps.to_vec());
        self.failure.check("client-applications")?;

        let mut stored = lock(&self.apps);
        for reg in apps {
            Self::merge(&mut stored, ApplicationRecord::from(reg));
        }
        Ok(())
    }

    async fn upsert(&self, app: ApplicationRecord) -> Result<(), StoreError> {
        self.failure.check("client-applications")?;
        Self::merge(&mut lock(&self.apps), app);
        Ok(())
    }

    async fn set_unannounced_to_announced(&self) -> Result<Vec<ApplicationRecord>, StoreError> {
        self.failure.check("client-applications")?;

        let mut announced = Vec::new();
        for app in lock(&self.apps).values_mut() {
            if !app.announced {
                app.announced = true;
                announced.push(app.clone());
            }
        }
        Ok(announced)
    }

    async fn get_applications(
        &self,
        query: &ApplicationQuery,
    ) -> Result<Vec<ApplicationRecord>, StoreError> {
        self.failure.check("client-applications")?;

        let apps = lock(&self.apps);
        let matching = apps
            .values()
            .filter(|app| match &query.strategy_name {
                Some(strategy) => app.strategies.iter().any(|s| s == strategy),
                None => true,
            })
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn get_application(
        &self,
        app_name: &str,
    ) -> Result<Option<ApplicationRecord>, StoreError> {
        self.failure.check("client-applications")?;
        Ok(lock(&self.apps).get(app_name).cloned())
    }

    async fn delete_application(&self, app_name: &str) -> Result<(), StoreError> {
        self.failure.check("client-applications")?;
        lock(&self.apps).remove(app_name);
        Ok(())
    }
}

// ============================================================================
// Client instances
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    instances: Mutex<BTreeMap<(String, String), AppInstance>>,
    bulk_batches: Mutex<Vec<Vec<ClientRegistration>>>,
    failure: Failure,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bulk_batches(&self) -> Vec<Vec<ClientRegistration>> {
        lock(&self.bulk_batches).clone()
    }

    pub fn instances(&self) -> Vec<AppInstance> {
        lock(&self.instances).values().cloned().collect()
    }

    pub fn fail_with(&self, message: Option<&str>) {
        self.failure.set(message);
    }
}

#[async_trait]
impl ClientInstanceStore for MemoryInstanceStore {
    async fn bulk_upsert(&self, instances: &[ClientRegistration]) -> Result<(), StoreError> {
        lock(&self.bulk_batches).push(instances.to_vec());
        self.failure.check("client-instances")?;

        let now = Utc::now();
        let mut stored = lock(&self.instances);
        for reg in instances {
            let key = (reg.app_name.clone(), reg.instance_id.clone());
            let entry = stored.entry(key).or_insert_with(|| AppInstance {
                app_name: reg.app_name.clone(),
                instance_id: reg.instance_id.clone(),
                sdk_version: None,
                client_ip: None,
                last_seen: now,
                created_at: now,
            });
            entry.sdk_version = reg.sdk_version.clone().or(entry.sdk_version.take());
            entry.client_ip = reg.client_ip.clone().or(entry.client_ip.take());
            entry.last_seen = now;
        }
        Ok(())
    }

    async fn insert(&self, sighting: InstanceSighting) -> Result<(), StoreError> {
        self.failure.check("client-instances")?;

        let now = Utc::now();
        let key = (sighting.app_name.clone(), sighting.instance_id.clone());
        let mut stored = lock(&self.instances);
        let entry = stored.entry(key).or_insert_with(|| AppInstance {
            app_name: sighting.app_name.clone(),
            instance_id: sighting.instance_id.clone(),
            sdk_version: None,
            client_ip: None,
            last_seen: now,
            created_at: now,
        });
        entry.client_ip = Some(sighting.client_ip);
        entry.last_seen = now;
        Ok(())
    }

    async fn get_by_app_name(&self, app_name: &str) -> Result<Vec<AppInstance>, StoreError> {
        self.failure.check("client-instances")?;
        Ok(lock(&self.instances)
            .values()
            .filter(|i| i.app_name == app_name)
            .cloned()
            .collect())
    }

    async fn delete_for_application(&self, app_name: &str) -> Result<(), StoreError> {
        self.failure.check("client-instances")?;
        lock(&self.instances).retain(|(app, _), _| app != app_name);
        Ok(())
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
    batches: Mutex<usize>,
    failure: Failure,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        lock(&self.events).clone()
    }

    /// Number of `batch_store` calls received.
    pub fn batch_count(&self) -> usize {
        *lock(&self.batches)
    }

    pub fn fail_with(&self, message: Option<&str>) {
        self.failure.set(message);
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn batch_store(&self, events: Vec<CreateEvent>) -> Result<(), StoreError> {
        *lock(&self.batches) += 1;
        self.failure.check("events")?;
        lock(&self.events).extend(events.into_iter().map(StoredEvent::new));
        Ok(())
    }
}

// ============================================================================
// Feature toggles and strategies
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryFeatureToggleStore {
    features: Mutex<BTreeMap<String, FeatureSummary>>,
    failure: Failure,
}

impl MemoryFeatureToggleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_features(features: impl IntoIterator<Item = FeatureSummary>) -> Self {
        let store = Self::new();
        {
            let mut map = lock(&store.features);
            for feature in features {
                map.insert(feature.name.clone(), feature);
            }
        }
        store
    }

    pub fn feature(&self, name: &str) -> Option<FeatureSummary> {
        lock(&self.features).get(name).cloned()
    }

    pub fn fail_with(&self, message: Option<&str>) {
        self.failure.set(message);
    }
}

#[async_trait]
impl FeatureToggleStore for MemoryFeatureToggleStore {
    async fn last_seen_toggles(&self, names: &[String]) -> Result<(), StoreError> {
        self.failure.check("feature-toggles")?;

        let now = Utc::now();
        let mut features = lock(&self.features);
        for name in names {
            if let Some(feature) = features.get_mut(name) {
                feature.last_seen_at = Some(now);
            }
        }
        Ok(())
    }

    async fn get_features(&self) -> Result<Vec<FeatureSummary>, StoreError> {
        self.failure.check("feature-toggles")?;
        Ok(lock(&self.features).values().cloned().collect())
    }
}

#[derive(Debug)]
pub struct MemoryStrategyStore {
    strategies: Vec<StrategySummary>,
}

impl MemoryStrategyStore {
    pub fn new(strategies: Vec<StrategySummary>) -> Self {
        Self { strategies }
    }
}

impl Default for MemoryStrategyStore {
    /// Only the built-in `default` strategy.
    fn default() -> Self {
        Self::new(vec![StrategySummary {
            name: "default".into(),
            description: Some("Default on/off strategy.".into()),
        }])
    }
}

#[async_trait]
impl StrategyStore for MemoryStrategyStore {
    async fn get_strategies(&self) -> Result<Vec<StrategySummary>, StoreError> {
        Ok(self.strategies.clone())
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// One of each memory store, kept concrete so callers can inspect them.
#[derive(Clone, Debug)]
pub struct MemoryStores {
    pub client_metrics: Arc<MemoryClientMetricsStore>,
    pub client_applications: Arc<MemoryApplicationStore>,
    pub client_instances: Arc<MemoryInstanceStore>,
    pub events: Arc<MemoryEventStore>,
    pub feature_toggles: Arc<MemoryFeatureToggleStore>,
    pub strategies: Arc<MemoryStrategyStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            client_metrics: Arc::new(MemoryClientMetricsStore::new()),
            client_applications: Arc::new(MemoryApplicationStore::new()),
            client_instances: Arc::new(MemoryInstanceStore::new()),
            events: Arc::new(MemoryEventStore::new()),
            feature_toggles: Arc::new(MemoryFeatureToggleStore::new()),
            strategies: Arc::new(MemoryStrategyStore::default()),
        }
    }

    pub fn with_feature_toggles(mut self, store: MemoryFeatureToggleStore) -> Self {
        self.feature_toggles = Arc::new(store);
        self
    }

    pub fn with_strategies(mut self, store: MemoryStrategyStore) -> Self {
        self.strategies = Arc::new(store);
        self
    }

    /// Type-erased handles for the service.
    pub fn stores(&self) -> Stores {
        Stores {
            client_metrics: self.client_metrics.clone(),
            client_applications: self.client_applications.clone(),
            client_instances: self.client_instances.clone(),
            events: self.events.clone(),
            feature_toggles: self.feature_toggles.clone(),
            strategies: self.strategies.clone(),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}
