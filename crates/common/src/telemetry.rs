//! Tracing and metrics initialisation

use crate::config::ObservabilityConfig;
use crate::error::{BatchCoreError, Result};
use crate::metrics::METRICS;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails (instead of panicking)
/// when a global subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.log_level)))
        .map_err(|e| BatchCoreError::config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| BatchCoreError::config(format!("Tracing already initialised: {}", e)))
}

/// Apply `config` to the global metrics registry, then install tracing.
pub fn init_observability(config: &ObservabilityConfig) -> Result<()> {
    METRICS.configure(config);
    init_tracing(config)
}

fn default_directives(level: &str) -> String {
    format!("batchcore_engine={level},batchcore_common={level}")
}
