mod commands;
mod input;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "unleash-metrics")]
#[command(about = "Aggregate Unleash client metrics from JSON lines", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: $UNLEASH_METRICS_CONFIG or unleash-metrics.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `unleash_metrics_core=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a JSON-lines file and print the resulting state as JSON
    Replay {
        input: PathBuf,
        /// Address recorded for every client in the file
        #[arg(long, default_value = "127.0.0.1")]
        client_ip: String,
        /// Evaluate windows as of this RFC 3339 time instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Ingest JSON lines from stdin with all timers running
    Run {
        /// Snapshot interval in milliseconds
        #[arg(long, default_value_t = 10_000)]
        report_ms: u64,
        #[arg(long, default_value = "127.0.0.1")]
        client_ip: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (source, config) = commands::load_config(cli.config.as_deref())?;
    logging::setup_logging(
        logging::effective_level(cli.log_level.as_deref(), &config.log_level),
        cli.log_format,
    );

    match cli.command {
        Commands::Replay {
            input,
            client_ip,
            at,
        } => commands::run_replay(&input, config, &client_ip, at).await,
        Commands::Run {
            report_ms,
            client_ip,
        } => commands::run_live(config, Duration::from_millis(report_ms), &client_ip).await,
        Commands::Config => commands::run_config(source.as_deref(), &config),
    }
}
