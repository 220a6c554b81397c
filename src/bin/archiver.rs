use anyhow::Result;
use bend_archiver::{Archiver, Config};
use clap::Parser;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "bend-archiver",
    about = "Archive source tables and CSV files into Databend"
)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short = 'f', long = "config", default_value = "config/conf.json")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    bend_archiver::telemetry::init_telemetry().expect("Failed to initialize telemetry");

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    tracing::info!(
        config = %cli.config,
        database_type = config.database_type.as_str(),
        "configuration loaded"
    );

    let start = Instant::now();
    let result = Archiver::new(config).run().await;

    match &result {
        Ok(summary) => {
            tracing::info!(
                tables = summary.tables_succeeded,
                rows = summary.rows_loaded,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "archive run complete"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "archive run failed");
        }
    }

    // Flush pending telemetry spans before the process exits
    bend_archiver::telemetry::shutdown_telemetry();

    result.map(|_| ())
}
