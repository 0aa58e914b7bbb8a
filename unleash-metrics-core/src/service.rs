//! The client metrics service
//!
//! Ingests metrics buckets into a last-hour and a last-minute window, each
//! paired with a rolling [`Projection`] that gives back counts as buckets
//! expire. Alongside it tracks which toggles every application has reported,
//! buffers client registrations for a periodic bulk write, and announces
//! applications the first time they are stored.
//!
//! Background work (window sweeps, registration flush, announcements and the
//! metrics-store subscription) starts with [`ClientMetricsService::start`] and
//! stops with [`ClientMetricsService::destroy`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::count::{self, YesNoCount};
use crate::error::{MetricsError, StoreError};
use crate::event::CreateEvent;
use crate::lock;
use crate::model::{
    AppName, AppWithToggles, ApplicationDetails, ApplicationLinks, ApplicationQuery,
    ApplicationRecord, ClientMetrics, ClientRegistration, InstanceSighting, Lookup, SeenApp,
    SharedToggles, ToggleName, TogglesMetrics,
};
use crate::projection::Projection;
use crate::scheduler::PeriodicTask;
use crate::schema;
use crate::store::Stores;
use crate::ttl::{self, SharedWindow, TtlWindow};

type MetricsWindow = SharedWindow<SharedToggles, Projection>;

#[derive(Debug, Default)]
struct AppTally {
    seen_toggles: BTreeSet<ToggleName>,
    count: u64,
}

#[derive(Debug, Default)]
struct Tallies {
    payloads: u64,
    global_count: u64,
    apps: BTreeMap<AppName, AppTally>,
}

/// Registrations waiting for the next flush, keyed by `appName_instanceId`.
/// The sequence number orders registrations so the latest per app wins.
#[derive(Debug, Default)]
struct RegistrationBuffer {
    next_seq: u64,
    seen_clients: BTreeMap<String, (u64, ClientRegistration)>,
}

impl RegistrationBuffer {
    fn insert(&mut self, registration: ClientRegistration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seen_clients
            .insert(registration.client_key(), (seq, registration));
    }

    /// Take every buffered registration in registration order.
    fn drain(&mut self) -> Vec<ClientRegistration> {
        let mut entries: Vec<_> = std::mem::take(&mut self.seen_clients).into_values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, reg)| reg).collect()
    }
}

/// One registration per application, the most recently registered winning.
fn unique_apps(registrations: &[ClientRegistration]) -> Vec<ClientRegistration> {
    let mut latest: BTreeMap<&str, usize> = BTreeMap::new();
    for (idx, reg) in registrations.iter().enumerate() {
        latest.insert(reg.app_name.as_str(), idx);
    }
    let mut picked: Vec<usize> = latest.into_values().collect();
    picked.sort_unstable();
    picked.into_iter().map(|idx| registrations[idx].clone()).collect()
}

struct Inner {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    stores: Stores,
    last_hour: MetricsWindow,
    last_minute: MetricsWindow,
    tallies: Mutex<Tallies>,
    registrations: Mutex<RegistrationBuffer>,
    subscription: Mutex<Option<mpsc::UnboundedReceiver<ClientMetrics>>>,
    tasks: Mutex<Vec<PeriodicTask>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    destroyed: AtomicBool,
}

#[derive(Clone)]
pub struct ClientMetricsService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientMetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetricsService")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl ClientMetricsService {
    /// Build the service. The metrics-store subscription is taken here, so
    /// payloads inserted before [`start`](Self::start) are not lost.
    pub fn new(stores: Stores, config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        let last_hour = Arc::new(Mutex::new(TtlWindow::new(
            config.last_hour.expire_after,
            config.last_hour.sweep_interval(),
            Projection::new(),
        )));
        let last_minute = Arc::new(Mutex::new(TtlWindow::new(
            config.last_minute.expire_after,
            config.last_minute.sweep_interval(),
            Projection::new(),
        )));
        let subscription = stores.client_metrics.subscribe();

        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                stores,
                last_hour,
                last_minute,
                tallies: Mutex::new(Tallies::default()),
                registrations: Mutex::new(RegistrationBuffer::default()),
                subscription: Mutex::new(Some(subscription)),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.inner.config
    }

    /// Spawn the window sweepers, the registration flush, the announcement
    /// task and the metrics-store subscription on the current tokio runtime.
    /// Calling it again, or after [`destroy`](Self::destroy), does nothing.
    pub fn start(&self) {
        if self.is_destroyed() || self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let clock = Arc::clone(&self.inner.clock);
        let mut tasks = vec![
            ttl::spawn_sweeper(
                "last-hour-sweep",
                Arc::clone(&self.inner.last_hour),
                Arc::clone(&clock),
            ),
            ttl::spawn_sweeper(
                "last-minute-sweep",
                Arc::clone(&self.inner.last_minute),
                clock,
            ),
        ];

        let weak = Arc::downgrade(&self.inner);
        tasks.push(PeriodicTask::spawn(
            "registration-flush",
            self.inner.config.bulk_interval(),
            move || {
                let service = Self::from_weak(&weak);
                async move {
                    if let Some(service) = service {
                        service.bulk_add().await;
                    }
                }
            },
        ));

        let weak = Arc::downgrade(&self.inner);
        tasks.push(PeriodicTask::spawn(
            "application-announce",
            self.inner.config.announcement_interval(),
            move || {
                let service = Self::from_weak(&weak);
                async move {
                    if let Some(service) = service {
                        service.announce_unannounced().await;
                    }
                }
            },
        ));

        lock(&self.inner.tasks).extend(tasks);

        if let Some(rx) = lock(&self.inner.subscription).take() {
            tokio::spawn(subscribe_metrics(
                Arc::downgrade(&self.inner),
                rx,
                self.inner.shutdown.clone(),
            ));
        }

        info!(
            bulk_interval_ms = self.inner.config.bulk_interval_ms,
            announcement_interval_ms = self.inner.config.announcement_interval_ms,
            "client metrics service started"
        );
    }

    /// Stop all background work and release both windows. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.shutdown.cancel();
        for task in lock(&self.inner.tasks).drain(..) {
            task.cancel();
        }
        lock(&self.inner.subscription).take();
        lock(&self.inner.last_hour).destroy();
        lock(&self.inner.last_minute).destroy();

        info!("client metrics service destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// Fold one metrics payload into both projections and windows. Ignored
    /// once the service is destroyed.
    pub fn add_payload(&self, metrics: &ClientMetrics) {
        if self.is_destroyed() {
            return;
        }

        let bucket = &metrics.bucket;
        let counts: Vec<(&str, YesNoCount)> = bucket
            .toggles
            .iter()
            .map(|(name, raw)| (name.as_str(), count::normalize(raw)))
            .collect();
        let total = counts
            .iter()
            .fold(0u64, |acc, (_, c)| acc.saturating_add(c.total()));

        let toggles: SharedToggles = Arc::new(bucket.toggles.clone());
        let now = self.inner.clock.now();

        for window in [&self.inner.last_hour, &self.inner.last_minute] {
            let mut window = lock(window);
            let projection = window.listener_mut();
            for (name, c) in &counts {
                projection.add(name, *c);
            }
            // Projection gets the counts first so a stale bucket nets out to zero
            window.add(Arc::clone(&toggles), bucket.stop, now);
        }

        let mut tallies = lock(&self.inner.tallies);
        tallies.payloads += 1;
        tallies.global_count = tallies.global_count.saturating_add(total);
        let app = tallies.apps.entry(metrics.app_name.clone()).or_default();
        app.count = app.count.saturating_add(total);
        app.seen_toggles.extend(bucket.toggles.keys().cloned());
    }

    /// Evict expired buckets from both windows now. Returns the number of
    /// buckets evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let hour = lock(&self.inner.last_hour).sweep(now);
        let minute = lock(&self.inner.last_minute).sweep(now);
        hour + minute
    }

    /// Validate and record a metrics report from an SDK. The payload reaches
    /// the projections through the metrics-store subscription.
    pub async fn register_client_metrics(
        &self,
        metrics: ClientMetrics,
        client_ip: &str,
    ) -> Result<(), MetricsError> {
        schema::validate_client_metrics(&metrics)?;

        let toggle_names: Vec<String> = metrics.bucket.toggles.keys().cloned().collect();
        let sighting = InstanceSighting {
            app_name: metrics.app_name.clone(),
            instance_id: metrics.instance_id.clone(),
            client_ip: client_ip.to_string(),
        };

        let stores = &self.inner.stores;
        stores.feature_toggles.last_seen_toggles(&toggle_names).await?;
        stores.client_metrics.insert(metrics).await?;
        stores.client_instances.insert(sighting).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Buffer a client registration until the next flush. A later
    /// registration for the same app instance replaces an earlier one.
    pub fn register_client(
        &self,
        mut registration: ClientRegistration,
        client_ip: &str,
    ) -> Result<(), MetricsError> {
        schema::validate_registration(&registration)?;
        registration.client_ip = Some(client_ip.to_string());
        registration.created_by = Some(client_ip.to_string());
        lock(&self.inner.registrations).insert(registration);
        Ok(())
    }

    pub fn pending_registrations(&self) -> usize {
        lock(&self.inner.registrations).seen_clients.len()
    }

    /// Write buffered registrations out: one application per app name, then
    /// every instance. Store failures are logged and the batch is dropped.
    pub async fn bulk_add(&self) {
        let registrations = lock(&self.inner.registrations).drain();
        if registrations.is_empty() {
            return;
        }

        if let Err(e) = self.store_registrations(&registrations).await {
            warn!(error = %e, count = registrations.len(), "Failed to register clients");
        }
    }

    async fn store_registrations(
        &self,
        registrations: &[ClientRegistration],
    ) -> Result<(), StoreError> {
        let apps = unique_apps(registrations);
        let stores = &self.inner.stores;
        stores.client_applications.bulk_upsert(&apps).await?;
        stores.client_instances.bulk_upsert(registrations).await?;
        debug!(
            apps = apps.len(),
            instances = registrations.len(),
            "registered clients"
        );
        Ok(())
    }

    /// Emit an `application-created` event for every application stored
    /// since the last announcement. Failures are logged.
    pub async fn announce_unannounced(&self) {
        if let Err(e) = self.try_announce().await {
            warn!(error = %e, "Failed to announce applications");
        }
    }

    async fn try_announce(&self) -> Result<(), StoreError> {
        let stores = &self.inner.stores;
        let apps = stores
            .client_applications
            .set_unannounced_to_announced()
            .await?;
        if apps.is_empty() {
            return Ok(());
        }

        let count = apps.len();
        let events = apps
            .into_iter()
            .map(CreateEvent::application_created)
            .collect();
        stores.events.batch_store(events).await?;
        info!(count, "announced new applications");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn get_toggles_metrics(&self) -> TogglesMetrics {
        TogglesMetrics {
            last_hour: lock(&self.inner.last_hour).listener().get_projection(),
            last_minute: lock(&self.inner.last_minute).listener().get_projection(),
        }
    }

    pub fn get_apps_with_toggles(&self) -> Vec<AppWithToggles> {
        lock(&self.inner.tallies)
            .apps
            .iter()
            .map(|(app_name, tally)| AppWithToggles {
                app_name: app_name.clone(),
                seen_toggles: tally.seen_toggles.iter().cloned().collect(),
                metrics_count: tally.count,
            })
            .collect()
    }

    /// Toggles reported by `app_name`; empty for an unknown app.
    pub fn get_seen_toggles_by_app_name(&self, app_name: &str) -> Vec<ToggleName> {
        lock(&self.inner.tallies)
            .apps
            .get(app_name)
            .map(|tally| tally.seen_toggles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_seen_apps_per_toggle(&self) -> BTreeMap<ToggleName, Vec<SeenApp>> {
        let tallies = lock(&self.inner.tallies);
        let mut toggles: BTreeMap<ToggleName, Vec<SeenApp>> = BTreeMap::new();
        for (app_name, tally) in &tallies.apps {
            for toggle in &tally.seen_toggles {
                toggles
                    .entry(toggle.clone())
                    .or_default()
                    .push(SeenApp::named(app_name));
            }
        }
        toggles
    }

    /// [`get_seen_apps_per_toggle`](Self::get_seen_apps_per_toggle) with the
    /// stored application metadata merged in where available.
    pub async fn get_seen_apps(&self) -> Result<BTreeMap<ToggleName, Vec<SeenApp>>, MetricsError> {
        let seen = self.get_seen_apps_per_toggle();
        let applications = self
            .inner
            .stores
            .client_applications
            .get_applications(&ApplicationQuery::default())
            .await?;
        let meta: BTreeMap<&str, &ApplicationRecord> = applications
            .iter()
            .map(|app| (app.app_name.as_str(), app))
            .collect();

        Ok(seen
            .into_iter()
            .map(|(toggle, apps)| {
                let apps = apps
                    .into_iter()
                    .map(|app| match meta.get(app.app_name.as_str()) {
                        Some(record) => app.merge(record),
                        None => app,
                    })
                    .collect();
                (toggle, apps)
            })
            .collect())
    }

    pub async fn get_applications(
        &self,
        query: &ApplicationQuery,
    ) -> Result<Vec<ApplicationRecord>, MetricsError> {
        Ok(self
            .inner
            .stores
            .client_applications
            .get_applications(query)
            .await?)
    }

    /// Everything known about one application, with its strategies and seen
    /// toggles resolved against their stores.
    pub async fn get_application(&self, app_name: &str) -> Result<ApplicationDetails, MetricsError> {
        let seen_toggles = self.get_seen_toggles_by_app_name(app_name);
        let stores = &self.inner.stores;

        let (application, instances, strategies, features) = tokio::try_join!(
            stores.client_applications.get_application(app_name),
            stores.client_instances.get_by_app_name(app_name),
            stores.strategies.get_strategies(),
            stores.feature_toggles.get_features(),
        )?;

        let application = application.ok_or_else(|| MetricsError::ApplicationNotFound {
            app_name: app_name.to_string(),
        })?;

        let strategies = application
            .strategies
            .iter()
            .map(|name| match strategies.iter().find(|s| &s.name == name) {
                Some(found) => Lookup::Found(found.clone()),
                None => Lookup::missing(name),
            })
            .collect();
        let seen_toggles = seen_toggles
            .iter()
            .map(|name| match features.iter().find(|f| &f.name == name) {
                Some(found) => Lookup::Found(found.clone()),
                None => Lookup::missing(name),
            })
            .collect();

        Ok(ApplicationDetails {
            links: ApplicationLinks {
                self_link: format!("/api/applications/{}", application.app_name),
            },
            app_name: application.app_name,
            created_at: application.created_at,
            description: application.description,
            url: application.url,
            color: application.color,
            icon: application.icon,
            strategies,
            instances,
            seen_toggles,
        })
    }

    pub async fn create_application(&self, app: ApplicationRecord) -> Result<(), MetricsError> {
        schema::validate_application(&app)?;
        self.inner.stores.client_applications.upsert(app).await?;
        Ok(())
    }

    /// Remove an application and all of its instances.
    pub async fn delete_application(&self, app_name: &str) -> Result<(), MetricsError> {
        let stores = &self.inner.stores;
        stores.client_instances.delete_for_application(app_name).await?;
        stores.client_applications.delete_application(app_name).await?;
        Ok(())
    }

    /// Number of payloads folded in so far.
    pub fn payload_count(&self) -> u64 {
        lock(&self.inner.tallies).payloads
    }

    pub fn global_count(&self) -> u64 {
        lock(&self.inner.tallies).global_count
    }

    pub fn app_count(&self, app_name: &str) -> Option<u64> {
        lock(&self.inner.tallies).apps.get(app_name).map(|t| t.count)
    }

    /// Buckets currently held by the last-hour and last-minute windows.
    pub fn window_sizes(&self) -> (usize, usize) {
        (
            lock(&self.inner.last_hour).len(),
            lock(&self.inner.last_minute).len(),
        )
    }
}

/// Feed every payload inserted into the metrics store into the service.
async fn subscribe_metrics(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<ClientMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(metrics) => match ClientMetricsService::from_weak(&inner) {
                    Some(service) => service.add_payload(&metrics),
                    None => break,
                },
                None => break,
            },
        }
    }
    debug!("metrics subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, RuntimeClock};
    use crate::model::{Bucket, FeatureSummary, ToggleCount};
    use crate::store::ClientMetricsStore;
    use crate::store::memory::{MemoryFeatureToggleStore, MemoryStores};
    use chrono::{DateTime, TimeDelta, Utc};
    use std::time::Duration;

    const APP: &str = "appName";
    const INSTANCE: &str = "instanceId";

    fn metrics(
        app: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
        toggles: &[(&str, ToggleCount)],
    ) -> ClientMetrics {
        ClientMetrics {
            app_name: app.into(),
            instance_id: INSTANCE.into(),
            environment: None,
            bucket: Bucket {
                start,
                stop,
                toggles: toggles
                    .iter()
                    .map(|(name, count)| (name.to_string(), count.clone()))
                    .collect(),
            },
        }
    }

    fn registration(app: &str, instance: &str, started: DateTime<Utc>) -> ClientRegistration {
        ClientRegistration {
            app_name: app.into(),
            instance_id: instance.into(),
            sdk_version: None,
            strategies: vec!["default".into()],
            started,
            interval: 10,
            client_ip: None,
            created_by: None,
        }
    }

    fn manual_service(config: MetricsConfig) -> (ClientMetricsService, Arc<ManualClock>, MemoryStores) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let stores = MemoryStores::new();
        let service = ClientMetricsService::new(stores.stores(), config, clock.clone());
        (service, clock, stores)
    }

    fn runtime_service(config: MetricsConfig) -> (ClientMetricsService, Arc<RuntimeClock>, MemoryStores) {
        let clock = Arc::new(RuntimeClock::new());
        let stores = MemoryStores::new();
        let service = ClientMetricsService::new(stores.stores(), config, clock.clone());
        (service, clock, stores)
    }

    fn yes_no(yes: u64, no: u64) -> YesNoCount {
        YesNoCount::new(yes, no)
    }

    /// Wait until `done` holds, yielding to background tasks in between.
    async fn settle(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("background task did not settle");
    }

    #[test]
    fn test_works_without_state() {
        let (service, _, _) = manual_service(MetricsConfig::default());
        assert!(service.get_apps_with_toggles().is_empty());
        assert_eq!(service.get_toggles_metrics(), TogglesMetrics::default());
        service.destroy();
    }

    #[test]
    fn test_payloads_accumulate() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();

        service.add_payload(&metrics(APP, now, now, &[("toggleX", ToggleCount::new(123, 0))]));
        assert_eq!(service.app_count(APP), Some(123));
        assert_eq!(service.global_count(), 123);

        service.add_payload(&metrics(APP, now, now, &[("toggleX", ToggleCount::new(10, 10))]));
        assert_eq!(service.global_count(), 143);

        assert_eq!(service.payload_count(), 2);

        let toggles = service.get_toggles_metrics();
        assert_eq!(toggles.last_hour["toggleX"], yes_no(133, 10));
        assert_eq!(toggles.last_minute["toggleX"], yes_no(133, 10));
    }

    #[test]
    fn test_seen_toggles_per_app() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        service.add_payload(&metrics(
            APP,
            now,
            now,
            &[
                ("toggleX", ToggleCount::new(123, 0)),
                ("toggleY", ToggleCount::new(50, 50)),
            ],
        ));

        let apps = service.get_apps_with_toggles();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].seen_toggles, vec!["toggleX", "toggleY"]);
        assert_eq!(apps[0].metrics_count, 223);
        assert_eq!(service.get_seen_toggles_by_app_name(APP), vec!["toggleX", "toggleY"]);
        assert!(service.get_seen_toggles_by_app_name("unknown").is_empty());

        let per_toggle = service.get_seen_apps_per_toggle();
        assert_eq!(per_toggle["toggleY"], vec![SeenApp::named(APP)]);
    }

    #[test]
    fn test_many_toggles() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        let counts: Vec<(String, ToggleCount)> = (0..100)
            .map(|i| (format!("toggle{i}"), ToggleCount::new(i, i)))
            .collect();
        let toggles: Vec<(&str, ToggleCount)> = counts
            .iter()
            .map(|(name, count)| (name.as_str(), count.clone()))
            .collect();

        service.add_payload(&metrics(APP, now, now, &toggles));

        assert_eq!(service.get_seen_toggles_by_app_name(APP).len(), 100);
    }

    #[test]
    fn test_missing_yes_no_counts_as_zero() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        service.add_payload(&metrics(APP, now, now, &[("toggleX", ToggleCount::new(123, 0))]));

        let unknown_fields: ToggleCount =
            serde_json::from_str(r#"{ "blue": 10, "green": 10 }"#).unwrap();
        service.add_payload(&metrics(APP, now, now, &[("toggleX", unknown_fields)]));

        assert_eq!(service.global_count(), 123);
        assert_eq!(service.get_toggles_metrics().last_minute["toggleX"], yes_no(123, 0));
    }

    #[test]
    fn test_last_minute_staircase() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        let ten = ToggleCount::new(10, 10);
        let buckets = [
            (now - TimeDelta::hours(1), now - TimeDelta::minutes(59)),
            (now - TimeDelta::minutes(30), now - TimeDelta::minutes(29)),
            (now - TimeDelta::minutes(2), now - TimeDelta::minutes(1)),
            (now - TimeDelta::minutes(2), now - TimeDelta::seconds(59)),
            (now, now - TimeDelta::seconds(30)),
        ];
        for (start, stop) in buckets {
            service.add_payload(&metrics(APP, start, stop, &[("toggle", ten.clone())]));
        }

        assert_eq!(service.get_seen_toggles_by_app_name(APP).len(), 1);
        assert_eq!(service.get_toggles_metrics().last_minute["toggle"], yes_no(20, 20));

        clock.advance(TimeDelta::seconds(10));
        service.sweep_expired();
        assert_eq!(service.get_toggles_metrics().last_minute["toggle"], yes_no(10, 10));

        clock.advance(TimeDelta::seconds(20));
        service.sweep_expired();
        assert_eq!(service.get_toggles_metrics().last_minute["toggle"], yes_no(0, 0));
    }

    #[test]
    fn test_last_hour_staircase() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        let ten = ToggleCount::new(10, 10);
        let buckets = [
            (now - TimeDelta::hours(1), now - TimeDelta::minutes(59), ten.clone()),
            (now - TimeDelta::minutes(30), now - TimeDelta::minutes(29), ten.clone()),
            (now - TimeDelta::minutes(15), now - TimeDelta::minutes(14), ten),
            (
                now + TimeDelta::minutes(59),
                now + TimeDelta::hours(1),
                ToggleCount::new(11, 11),
            ),
        ];
        for (start, stop, count) in buckets {
            service.add_payload(&metrics(APP, start, stop, &[("toggle", count)]));
        }

        let steps = [
            (TimeDelta::zero(), yes_no(41, 41)),
            (TimeDelta::seconds(10), yes_no(41, 41)),
            (TimeDelta::minutes(30), yes_no(31, 31)),
            (TimeDelta::minutes(15), yes_no(21, 21)),
            (TimeDelta::minutes(30), yes_no(11, 11)),
            (TimeDelta::minutes(45), yes_no(0, 0)),
        ];
        for (advance, expected) in steps {
            clock.advance(advance);
            service.sweep_expired();
            assert_eq!(service.get_toggles_metrics().last_hour["toggle"], expected);
        }
    }

    #[test]
    fn test_no_drift_after_expiry() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let now = clock.now();
        for i in 0..50i64 {
            let stop = now - TimeDelta::seconds(i * 37 % 300);
            let count = ToggleCount::new(i as u64, 2).with_variant("disabled", 1);
            service.add_payload(&metrics(APP, stop, stop, &[("a", count.clone()), ("b", count)]));
        }

        clock.advance(TimeDelta::hours(2));
        service.sweep_expired();

        let toggles = service.get_toggles_metrics();
        for projection in [&toggles.last_hour, &toggles.last_minute] {
            assert_eq!(projection["a"], yes_no(0, 0));
            assert_eq!(projection["b"], yes_no(0, 0));
        }
        assert_eq!(service.window_sizes(), (0, 0));
    }

    #[test]
    fn test_add_after_destroy_is_ignored() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        service.destroy();
        service.destroy();

        let now = clock.now();
        service.add_payload(&metrics(APP, now, now, &[("a", ToggleCount::new(1, 1))]));

        assert!(service.is_destroyed());
        assert_eq!(service.global_count(), 0);
        assert!(service.get_toggles_metrics().last_hour.is_empty());
        assert_eq!(service.sweep_expired(), 0);
    }

    #[test]
    fn test_registration_rejected_without_app_name() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        let result = service.register_client(registration("", "i-1", clock.now()), "127.0.0.1");
        assert!(matches!(result, Err(MetricsError::Validation(_))));
        assert_eq!(service.pending_registrations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_and_minute_windows_expire() {
        let (service, clock, _) = runtime_service(MetricsConfig::default());
        service.start();

        let now = clock.now();
        service.add_payload(&metrics(APP, now, now, &[("my-flag", ToggleCount::new(10, 0))]));

        tokio::time::sleep(Duration::from_secs(71)).await;
        let toggles = service.get_toggles_metrics();
        assert_eq!(toggles.last_minute["my-flag"], yes_no(0, 0));
        assert_eq!(toggles.last_hour["my-flag"], yes_no(10, 0));
        assert_eq!(service.window_sizes(), (1, 0));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(service.get_toggles_metrics().last_hour["my-flag"], yes_no(0, 0));
        assert_eq!(service.window_sizes(), (0, 0));

        service.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_client_registered_once_per_flush() {
        let (service, clock, stores) = runtime_service(MetricsConfig::default());
        service.start();

        let client = registration("test_app", "ava", clock.now());
        for _ in 0..4 {
            service.register_client(client.clone(), "127.0.0.1").unwrap();
        }
        tokio::time::sleep(Duration::from_secs(7)).await;

        let app_batches = stores.client_applications.bulk_batches();
        assert_eq!(app_batches.len(), 1);
        assert_eq!(stores.client_instances.bulk_batches().len(), 1);
        let registered = &app_batches[0];
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].app_name, client.app_name);
        assert_eq!(registered[0].instance_id, client.instance_id);
        assert_eq!(registered[0].started, client.started);
        assert_eq!(registered[0].interval, client.interval);
        assert_eq!(registered[0].created_by.as_deref(), Some("127.0.0.1"));

        service.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unique_clients_registered_together() {
        let (service, clock, stores) = runtime_service(MetricsConfig::default());
        service.start();

        let started = clock.now();
        for _ in 0..3 {
            service
                .register_client(registration("test_app", "client1", started), "127.0.0.1")
                .unwrap();
            service
                .register_client(registration("test_app_2", "client2", started), "127.0.0.1")
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(7)).await;

        let app_batches = stores.client_applications.bulk_batches();
        assert_eq!(app_batches.len(), 1);
        assert_eq!(app_batches[0].len(), 2);
        assert_eq!(stores.client_instances.bulk_batches().len(), 1);

        service.destroy();
    }

    #[tokio::test]
    async fn test_apps_deduplicated_across_instances() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        let started = clock.now();
        service
            .register_client(registration("shop", "i-1", started), "10.0.0.1")
            .unwrap();
        service
            .register_client(registration("shop", "i-2", started), "10.0.0.2")
            .unwrap();

        service.bulk_add().await;

        let apps = &stores.client_applications.bulk_batches()[0];
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].instance_id, "i-2");
        assert_eq!(stores.client_instances.bulk_batches()[0].len(), 2);
        assert_eq!(service.pending_registrations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_client_outside_flush_interval_registered_twice() {
        let config = MetricsConfig {
            bulk_interval_ms: 2000,
            ..MetricsConfig::default()
        };
        let (service, clock, stores) = runtime_service(config);
        service.start();

        let client = registration("test_app", "client1", clock.now());
        for _ in 0..3 {
            service.register_client(client.clone(), "127.0.0.1").unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        for _ in 0..3 {
            service.register_client(client.clone(), "127.0.0.1").unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        let app_batches = stores.client_applications.bulk_batches();
        assert_eq!(app_batches.len(), 2);
        assert_eq!(stores.client_instances.bulk_batches().len(), 2);
        assert_eq!(app_batches[0][0].app_name, app_batches[1][0].app_name);
        assert_eq!(app_batches[0][0].instance_id, app_batches[1][0].instance_id);

        service.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_flush_does_not_call_stores() {
        let (service, _, stores) = runtime_service(MetricsConfig::default());
        service.start();

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(stores.client_applications.bulk_batches().is_empty());
        assert!(stores.client_instances.bulk_batches().is_empty());
        service.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_flush_after_destroy() {
        let (service, clock, stores) = runtime_service(MetricsConfig::default());
        service.start();
        service
            .register_client(registration("test_app", "client1", clock.now()), "127.0.0.1")
            .unwrap();

        service.destroy();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(stores.client_applications.bulk_batches().is_empty());
    }

    #[tokio::test]
    async fn test_flush_failure_is_swallowed() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        stores.client_applications.fail_with(Some("connection refused"));
        service
            .register_client(registration("test_app", "client1", clock.now()), "127.0.0.1")
            .unwrap();

        service.bulk_add().await;

        assert_eq!(stores.client_applications.bulk_batches().len(), 1);
        assert!(stores.client_instances.bulk_batches().is_empty());
        assert_eq!(service.pending_registrations(), 0);

        service.bulk_add().await;
        assert_eq!(stores.client_applications.bulk_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_announces_new_applications_once() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        let started = clock.now();
        service
            .register_client(registration("app-a", "1", started), "10.0.0.1")
            .unwrap();
        service
            .register_client(registration("app-b", "1", started), "10.0.0.2")
            .unwrap();
        service.bulk_add().await;

        service.announce_unannounced().await;
        service.announce_unannounced().await;

        let events = stores.events.events();
        assert_eq!(stores.events.batch_count(), 1);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event.event_type.as_str() == "application-created"));
        let creators: BTreeSet<&str> = events.iter().map(|e| e.event.created_by.as_str()).collect();
        assert_eq!(creators, BTreeSet::from(["10.0.0.1", "10.0.0.2"]));
    }

    #[tokio::test]
    async fn test_announce_failure_is_swallowed() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        service
            .register_client(registration("app-a", "1", clock.now()), "10.0.0.1")
            .unwrap();
        service.bulk_add().await;
        stores.events.fail_with(Some("disk full"));

        service.announce_unannounced().await;

        assert_eq!(stores.events.batch_count(), 1);
        assert!(stores.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_registered_metrics_reach_projections() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        service.start();

        let now = clock.now();
        service
            .register_client_metrics(
                metrics(APP, now, now, &[("toggleX", ToggleCount::new(5, 1))]),
                "10.0.0.9",
            )
            .await
            .unwrap();

        settle(|| service.global_count() == 6).await;
        assert_eq!(service.get_toggles_metrics().last_hour["toggleX"], yes_no(5, 1));
        assert_eq!(stores.client_metrics.inserted().len(), 1);
        let instances = stores.client_instances.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].client_ip.as_deref(), Some("10.0.0.9"));

        service.destroy();
    }

    #[tokio::test]
    async fn test_metrics_burst_reaches_projections_without_loss() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        service.start();

        let now = clock.now();
        for _ in 0..2000 {
            service
                .register_client_metrics(
                    metrics(APP, now, now, &[("t", ToggleCount::new(1, 0))]),
                    "10.0.0.9",
                )
                .await
                .unwrap();
        }

        settle(|| service.payload_count() == 2000).await;
        assert_eq!(stores.client_metrics.inserted().len(), 2000);
        assert_eq!(service.get_toggles_metrics().last_hour["t"], yes_no(2000, 0));
        assert_eq!(service.get_toggles_metrics().last_minute["t"], yes_no(2000, 0));
        service.destroy();
    }

    #[tokio::test]
    async fn test_payloads_stored_before_start_are_ingested() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        let now = clock.now();
        stores
            .client_metrics
            .insert(metrics(APP, now, now, &[("early", ToggleCount::new(1, 0))]))
            .await
            .unwrap();

        service.start();

        settle(|| service.global_count() == 1).await;
        service.destroy();
    }

    #[tokio::test]
    async fn test_register_metrics_marks_toggles_seen() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let stores = MemoryStores::new().with_feature_toggles(MemoryFeatureToggleStore::with_features([
            FeatureSummary::named("toggleX"),
        ]));
        let service =
            ClientMetricsService::new(stores.stores(), MetricsConfig::default(), clock.clone());

        let now = clock.now();
        service
            .register_client_metrics(
                metrics(APP, now, now, &[("toggleX", ToggleCount::new(1, 0))]),
                "10.0.0.9",
            )
            .await
            .unwrap();

        let feature = stores.feature_toggles.feature("toggleX").unwrap();
        assert!(feature.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_metrics_rejected_before_stores() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        let now = clock.now();
        let result = service
            .register_client_metrics(metrics("", now, now, &[]), "10.0.0.9")
            .await;

        assert!(matches!(result, Err(MetricsError::Validation(_))));
        assert!(stores.client_metrics.inserted().is_empty());
    }

    #[tokio::test]
    async fn test_application_details_resolve_references() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let stores = MemoryStores::new().with_feature_toggles(MemoryFeatureToggleStore::with_features([
            FeatureSummary::named("toggleX"),
        ]));
        let service =
            ClientMetricsService::new(stores.stores(), MetricsConfig::default(), clock.clone());

        let mut reg = registration("shop", "i-1", clock.now());
        reg.strategies = vec!["default".into(), "gradualRollout".into()];
        service.register_client(reg, "10.0.0.1").unwrap();
        service.bulk_add().await;

        let now = clock.now();
        service.add_payload(&metrics(
            "shop",
            now,
            now,
            &[
                ("toggleX", ToggleCount::new(1, 0)),
                ("toggleY", ToggleCount::new(1, 0)),
            ],
        ));

        let details = service.get_application("shop").await.unwrap();

        assert_eq!(details.app_name, "shop");
        assert_eq!(details.links.self_link, "/api/applications/shop");
        assert_eq!(details.instances.len(), 1);
        assert!(details.strategies[0].is_found());
        assert_eq!(details.strategies[1], Lookup::missing("gradualRollout"));
        assert!(details.seen_toggles[0].is_found());
        assert_eq!(details.seen_toggles[1], Lookup::missing("toggleY"));
    }

    #[tokio::test]
    async fn test_unknown_application_not_found() {
        let (service, _, _) = manual_service(MetricsConfig::default());
        let result = service.get_application("nope").await;
        assert!(matches!(
            result,
            Err(MetricsError::ApplicationNotFound { app_name }) if app_name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_seen_apps_merge_metadata() {
        let (service, clock, _) = manual_service(MetricsConfig::default());
        service
            .create_application(ApplicationRecord {
                app_name: "shop".into(),
                description: Some("Web shop".into()),
                url: Some("https://shop.example.com".into()),
                ..ApplicationRecord::default()
            })
            .await
            .unwrap();

        let now = clock.now();
        service.add_payload(&metrics("shop", now, now, &[("a", ToggleCount::new(1, 0))]));
        service.add_payload(&metrics("unlisted", now, now, &[("a", ToggleCount::new(1, 0))]));

        let seen = service.get_seen_apps().await.unwrap();
        let apps = &seen["a"];
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].description.as_deref(), Some("Web shop"));
        assert!(apps[0].created_at.is_some());
        assert_eq!(apps[1], SeenApp::named("unlisted"));
    }

    #[tokio::test]
    async fn test_create_application_validates_url() {
        let (service, _, stores) = manual_service(MetricsConfig::default());
        let result = service
            .create_application(ApplicationRecord {
                app_name: "shop".into(),
                url: Some("shop.example.com".into()),
                ..ApplicationRecord::default()
            })
            .await;

        assert!(matches!(result, Err(MetricsError::Validation(_))));
        assert!(stores.client_applications.applications().is_empty());
    }

    #[tokio::test]
    async fn test_delete_application_removes_instances() {
        let (service, clock, stores) = manual_service(MetricsConfig::default());
        service
            .register_client(registration("shop", "i-1", clock.now()), "10.0.0.1")
            .unwrap();
        service.bulk_add().await;

        service.delete_application("shop").await.unwrap();

        assert!(stores.client_applications.applications().is_empty());
        assert!(stores.client_instances.instances().is_empty());
        let query = ApplicationQuery::default();
        assert!(service.get_applications(&query).await.unwrap().is_empty());
    }

    #[test]
    fn test_destroy_before_start_then_start_is_noop() {
        let (service, _, _) = manual_service(MetricsConfig::default());
        service.destroy();
        // No runtime here: start must return before spawning anything
        service.start();
        assert!(service.is_destroyed());
    }
}
