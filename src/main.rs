use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use nvda_forecast::config::Config;
use nvda_forecast::ml::ModelRegistry;
use nvda_forecast::telemetry;
use nvda_forecast::web::ApiServer;

#[derive(Parser)]
#[command(name = "nvda-forecast-api")]
#[command(about = "Serves NVDA price forecasts from pre-trained tabular and sequence models")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Overrides `server.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Overrides `models.dir`.
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing()?;

    let cli = Cli::parse();
    let mut config = Config::from_file(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.model_dir {
        config.models.dir = dir;
    }

    info!("Starting NVDA Forecast API");

    let metrics_handle = telemetry::install_metrics()?;

    // Loaded before binding so no request can observe a partial registry
    let registry = Arc::new(ModelRegistry::load(&config.models)?);
    if registry.is_empty() {
        warn!(
            "No models loaded from {}; /health will report unavailable",
            config.models.dir.display()
        );
    }

    let server = ApiServer::new(registry, &config).with_metrics(metrics_handle);
    server.start(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping server..."),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}
