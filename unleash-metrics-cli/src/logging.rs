use std::io::IsTerminal;

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Pick the filter directive: an explicit `--log-level` beats the config
/// file's `log_level`. `RUST_LOG` still wins over both in `setup_logging`.
pub fn effective_level<'a>(cli_level: Option<&'a str>, config_level: &'a str) -> &'a str {
    match cli_level {
        Some(level) if !level.trim().is_empty() => level,
        _ => config_level,
    }
}

/// Install the global subscriber. Logs go to stderr so reports on stdout
/// stay machine readable.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_ansi(std::io::stderr().is_terminal())
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
