//! Logging and metrics setup for the API binary.

use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `RUST_LOG` wins; otherwise `info`.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow!("Failed to init logging: {}", e))
}

/// Installs the global Prometheus recorder. The handle renders `/metrics`.
pub fn install_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("Failed to install metrics recorder: {}", e))?;

    metrics::describe_counter!("predictions_total", "Successful predictions");
    metrics::describe_counter!("prediction_errors_total", "Failed prediction requests");
    metrics::describe_histogram!(
        "inference_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent inside the model call"
    );
    metrics::describe_gauge!("models_loaded", "Models held by the registry");

    Ok(handle)
}
