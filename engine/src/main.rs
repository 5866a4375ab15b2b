// Courier conversational agent gateway
// Main entry point for the courier binary

use clap::Parser;
use courier_engine::cli::{Cli, Command};
use courier_engine::config::Config;
use courier_engine::handlers::{
    handle_doctor, handle_start, handle_status, handle_stop, OutputFormat,
};
use courier_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    init_telemetry();

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Courier v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Re-initialize telemetry with the effective log level
    // (only takes effect if RUST_LOG env var is not set)
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    match cli.command {
        Command::Start => {
            tracing::info!("Starting daemon...");
            handle_start(config).await
        }
        Command::Stop => handle_stop(&config, format).await,
        Command::Status => handle_status(&config, format).await,
        Command::Doctor => handle_doctor(&config, format).await,
    }
}
