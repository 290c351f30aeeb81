//! BatchCore common library
//!
//! This crate contains the configuration, error, metrics and tracing setup
//! shared by the engine.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Re-export commonly used types
pub use config::{BatchingConfig, EngineConfig, LoraConfig, ObservabilityConfig};
pub use error::{BatchCoreError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
pub use telemetry::{init_observability, init_tracing};
