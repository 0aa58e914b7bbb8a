use std::path::Path;

use anyhow::Result;
use unleash_metrics_core::MetricsConfig;

/// Print where the configuration came from and its effective values.
pub fn run_config(source: Option<&Path>, config: &MetricsConfig) -> Result<()> {
    match source {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# no config file found, using defaults"),
    }
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
