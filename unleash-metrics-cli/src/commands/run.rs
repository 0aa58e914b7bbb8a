use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use unleash_metrics_core::model::TogglesMetrics;
use unleash_metrics_core::store::memory::MemoryStores;
use unleash_metrics_core::{ClientMetricsService, MetricsConfig, MetricsError, SystemClock};

use super::wait_for_ingest;
use crate::input::{self, InboundLine};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    payloads: u64,
    global_count: u64,
    pending_registrations: usize,
    toggles: &'a TogglesMetrics,
}

fn print_snapshot(service: &ClientMetricsService) -> Result<()> {
    let toggles = service.get_toggles_metrics();
    let snapshot = Snapshot {
        payloads: service.payload_count(),
        global_count: service.global_count(),
        pending_registrations: service.pending_registrations(),
        toggles: &toggles,
    };
    println!("{}", serde_json::to_string(&snapshot)?);
    Ok(())
}

/// Returns whether the line was an accepted metrics report.
async fn handle_line(
    service: &ClientMetricsService,
    line: &str,
    client_ip: &str,
) -> Result<bool, MetricsError> {
    match input::parse_line(line)? {
        None => Ok(false),
        Some(InboundLine::Metrics(metrics)) => {
            service.register_client_metrics(metrics, client_ip).await?;
            Ok(true)
        }
        Some(InboundLine::Registration(registration)) => {
            service.register_client(registration, client_ip)?;
            Ok(false)
        }
    }
}

/// Feed lines from `reader` into a started service until EOF or `stop`
/// resolves, then fold in every accepted report, flush registrations and
/// announce. Returns the number of accepted metrics reports.
async fn ingest<R, S>(
    service: &ClientMetricsService,
    reader: R,
    report_every: Duration,
    client_ip: &str,
    stop: S,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    S: Future,
{
    let report_every = report_every.max(Duration::from_millis(1));
    let mut report = tokio::time::interval_at(Instant::now() + report_every, report_every);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut accepted = 0u64;
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("interrupted");
                break;
            }
            _ = report.tick() => print_snapshot(service)?,
            next = lines.next_line() => {
                let Some(line) = next.context("failed to read input")? else {
                    info!(lines = line_no, "end of input");
                    break;
                };
                line_no += 1;
                match handle_line(service, &line, client_ip).await {
                    Ok(true) => accepted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(line = line_no, error = %e, "skipping line"),
                }
            }
        }
    }

    wait_for_ingest(service, accepted).await?;
    service.bulk_add().await;
    service.announce_unannounced().await;
    Ok(accepted)
}

/// Read JSON lines from stdin into a running service with all timers live,
/// printing a snapshot every `report_every`. Stops on EOF or Ctrl-C, after a
/// last flush and announcement.
pub async fn run_live(config: MetricsConfig, report_every: Duration, client_ip: &str) -> Result<()> {
    let memory = MemoryStores::new();
    let service = ClientMetricsService::new(memory.stores(), config, Arc::new(SystemClock));
    service.start();

    info!(report_ms = report_every.as_millis() as u64, "reading metrics from stdin");
    let stdin = BufReader::new(tokio::io::stdin());
    let result = ingest(&service, stdin, report_every, client_ip, tokio::signal::ctrl_c()).await;

    // Background tasks stop even when ingestion failed
    let outcome = result.and_then(|_| print_snapshot(&service));
    info!(
        applications = memory.client_applications.applications().len(),
        events = memory.events.events().len(),
        "stopping"
    );
    service.destroy();
    outcome
}
