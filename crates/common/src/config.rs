//! Configuration structures for BatchCore
//!
//! This module defines the configuration for the batch assembler and the
//! LoRA adapter registry. Configurations are loaded from YAML files and can be
//! overridden by environment variables.

use crate::error::{BatchCoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "BATCHCORE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Batch assembly limits
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Adapter registry configuration
    #[serde(default)]
    pub lora: LoraConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Batch assembly limits
///
/// These are precondition checks on what the scheduler hands over; the
/// assembler never drops or reorders requests to satisfy them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum number of context (prefill) requests per step
    #[serde(default = "default_max_context_batch_size")]
    pub max_context_batch_size: usize,

    /// Maximum number of decode requests per step
    #[serde(default = "default_max_decode_batch_size")]
    pub max_decode_batch_size: usize,

    /// Maximum prompt length or total decode length of a single request
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Maximum number of tokens in one packed batch
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,
}

/// Adapter registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Number of transformer layers in the base model
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Maximum number of live adapters (0 = unbounded)
    #[serde(default)]
    pub max_adapters: usize,

    /// How often a blocked removal reports outstanding leases
    #[serde(default = "default_drain_warn_interval")]
    pub drain_warn_interval_ms: u64,

    /// Give up draining after this long (unset = wait forever)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_ms: Option<u64>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_max_context_batch_size() -> usize {
    256
}

fn default_max_decode_batch_size() -> usize {
    256
}

fn default_max_seq_len() -> usize {
    8192
}

fn default_max_batch_tokens() -> usize {
    16384
}

fn default_num_layers() -> usize {
    32
}

fn default_drain_warn_interval() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_context_batch_size: default_max_context_batch_size(),
            max_decode_batch_size: default_max_decode_batch_size(),
            max_seq_len: default_max_seq_len(),
            max_batch_tokens: default_max_batch_tokens(),
        }
    }
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            max_adapters: 0,
            drain_warn_interval_ms: default_drain_warn_interval(),
            drain_timeout_ms: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

impl LoraConfig {
    /// Config for a model with `num_layers` layers, everything else default
    pub fn with_layers(num_layers: usize) -> Self {
        Self {
            num_layers,
            ..Self::default()
        }
    }

    /// Interval between drain progress reports
    pub fn drain_warn_interval(&self) -> Duration {
        Duration::from_millis(self.drain_warn_interval_ms.max(1))
    }

    /// Diagnostic bound on a removal's drain wait
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| {
            BatchCoreError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from defaults plus whatever `lookup` provides
    /// for the `BATCHCORE_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("MAX_CONTEXT_BATCH_SIZE") {
            config.batching.max_context_batch_size = parse_var("MAX_CONTEXT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_DECODE_BATCH_SIZE") {
            config.batching.max_decode_batch_size = parse_var("MAX_DECODE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_SEQ_LEN") {
            config.batching.max_seq_len = parse_var("MAX_SEQ_LEN", &v)?;
        }
        if let Some(v) = get("MAX_BATCH_TOKENS") {
            config.batching.max_batch_tokens = parse_var("MAX_BATCH_TOKENS", &v)?;
        }
        if let Some(v) = get("NUM_LAYERS") {
            config.lora.num_layers = parse_var("NUM_LAYERS", &v)?;
        }
        if let Some(v) = get("MAX_ADAPTERS") {
            config.lora.max_adapters = parse_var("MAX_ADAPTERS", &v)?;
        }
        if let Some(v) = get("DRAIN_TIMEOUT_MS") {
            config.lora.drain_timeout_ms = Some(parse_var("DRAIN_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.observability = Some(ObservabilityConfig {
                log_level: v,
                ..ObservabilityConfig::default()
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let batching = &self.batching;
        if batching.max_context_batch_size == 0 && batching.max_decode_batch_size == 0 {
            return Err(BatchCoreError::config(
                "At least one of max_context_batch_size / max_decode_batch_size must be non-zero",
            ));
        }
        if batching.max_seq_len == 0 {
            return Err(BatchCoreError::config("max_seq_len must be non-zero"));
        }
        if batching.max_batch_tokens > i32::MAX as usize {
            return Err(BatchCoreError::config(format!(
                "max_batch_tokens {} does not fit the 32-bit index buffers",
                batching.max_batch_tokens
            )));
        }
        if self.lora.num_layers == 0 {
            return Err(BatchCoreError::config("lora.num_layers must be non-zero"));
        }
        if let Some(obs) = &self.observability {
            match obs.log_level.as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(BatchCoreError::config(format!("Invalid log level: {}", other)));
                }
            }
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        BatchCoreError::config(format!("Invalid value for {}{}: {:?}", ENV_PREFIX, name, value))
    })
}
