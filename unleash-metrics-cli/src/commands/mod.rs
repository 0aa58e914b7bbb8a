mod config;
mod replay;
mod run;

pub use config::run_config;
pub use replay::run_replay;
pub use run::run_live;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use unleash_metrics_core::ClientMetricsService;
use unleash_metrics_core::config::{ConfigError, MetricsConfig};

/// Resolve the configuration: an explicit path must load, otherwise the
/// usual locations are searched and defaults apply when nothing is found.
pub fn load_config(explicit: Option<&Path>) -> Result<(Option<PathBuf>, MetricsConfig)> {
    if let Some(path) = explicit {
        let config = MetricsConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        return Ok((Some(path.to_path_buf()), config));
    }

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    match MetricsConfig::discover(&cwd) {
        Ok((path, config)) => Ok((Some(path), config)),
        Err(ConfigError::NotFound { .. }) => Ok((None, MetricsConfig::default())),
        Err(e) => Err(e).context("failed to load discovered config"),
    }
}

/// Wait for the metrics subscription to fold in `expected` payloads.
async fn wait_for_ingest(service: &ClientMetricsService, expected: u64) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.payload_count() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("timed out waiting for metrics to be ingested")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_config_fails() {
        let path = std::env::temp_dir().join("unleash-metrics-does-not-exist.yaml");
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }
}
