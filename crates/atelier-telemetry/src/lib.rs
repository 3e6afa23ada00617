//! Logging setup for Atelier
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a
//! formatting layer chosen by configuration

use atelier_config::{LogFormat, TelemetryConfig};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging from configuration
///
/// `RUST_LOG` takes precedence over the configured filter. An invalid
/// filter falls back to `default_filter`, and then to `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: &TelemetryConfig, default_filter: &str) -> anyhow::Result<()> {
    let filter = build_filter(&config.log_filter, default_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry().with(filter).with(fmt_layer).try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json().flatten_event(true))
            .try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

fn build_filter(configured: &str, default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
