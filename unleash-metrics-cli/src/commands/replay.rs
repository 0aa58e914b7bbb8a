use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use unleash_metrics_core::event::StoredEvent;
use unleash_metrics_core::model::{
    AppInstance, AppWithToggles, ApplicationRecord, SeenApp, ToggleName, TogglesMetrics,
};
use unleash_metrics_core::store::memory::MemoryStores;
use unleash_metrics_core::{Clock, ClientMetricsService, ManualClock, MetricsConfig, SystemClock};

use super::wait_for_ingest;
use crate::input::{self, InboundLine};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineStats {
    pub metrics: u64,
    pub registrations: u64,
    pub rejected: u64,
}

/// Everything the pipeline holds after a replay.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub evaluated_at: DateTime<Utc>,
    pub lines: LineStats,
    pub toggles: TogglesMetrics,
    pub apps: Vec<AppWithToggles>,
    pub seen_apps: BTreeMap<ToggleName, Vec<SeenApp>>,
    pub applications: Vec<ApplicationRecord>,
    pub instances: Vec<AppInstance>,
    pub events: Vec<StoredEvent>,
}

/// Feed `content` through a fresh service backed by memory stores, then
/// flush registrations, announce applications and sweep both windows as of
/// `at` (wall-clock now when absent).
pub async fn replay(
    content: &str,
    config: MetricsConfig,
    client_ip: &str,
    at: Option<DateTime<Utc>>,
) -> Result<ReplayReport> {
    let clock: Arc<dyn Clock> = match at {
        Some(at) => Arc::new(ManualClock::new(at)),
        None => Arc::new(SystemClock),
    };
    let memory = MemoryStores::new();
    let service = ClientMetricsService::new(memory.stores(), config, Arc::clone(&clock));
    service.start();

    let mut lines = LineStats::default();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let result = match input::parse_line(line) {
            Ok(None) => continue,
            Ok(Some(InboundLine::Metrics(metrics))) => service
                .register_client_metrics(metrics, client_ip)
                .await
                .map(|()| lines.metrics += 1),
            Ok(Some(InboundLine::Registration(registration))) => service
                .register_client(registration, client_ip)
                .map(|()| lines.registrations += 1),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(line = line_no, error = %e, "skipping line");
            lines.rejected += 1;
        }
    }

    wait_for_ingest(&service, lines.metrics).await?;
    service.bulk_add().await;
    service.announce_unannounced().await;
    service.sweep_expired();

    let report = ReplayReport {
        evaluated_at: clock.now(),
        toggles: service.get_toggles_metrics(),
        apps: service.get_apps_with_toggles(),
        seen_apps: service.get_seen_apps().await?,
        applications: memory.client_applications.applications(),
        instances: memory.client_instances.instances(),
        events: memory.events.events(),
        lines,
    };
    service.destroy();

    info!(
        metrics = report.lines.metrics,
        registrations = report.lines.registrations,
        rejected = report.lines.rejected,
        "replay finished"
    );
    Ok(report)
}

pub async fn run_replay(
    path: &Path,
    config: MetricsConfig,
    client_ip: &str,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let report = replay(&content, config, client_ip, at).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
