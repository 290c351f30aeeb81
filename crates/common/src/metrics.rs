//! Metrics collection for BatchCore
//!
//! This module provides Prometheus metrics for observability.
//! Everything on the per-step path is a plain atomic update. Recording can be
//! switched off at runtime through [`ObservabilityConfig::enable_metrics`].

use crate::config::ObservabilityConfig;
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Metrics registry for BatchCore
#[derive(Debug)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub batch: BatchMetrics,
    pub lora: LoraMetrics,
    enabled: AtomicBool,
}

/// Batch assembly metrics
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    /// Total number of assembled batches
    pub assembled_total: IntCounter,

    /// Requests per assembled batch
    pub batch_size: Histogram,

    /// Tokens per assembled batch
    pub batch_tokens: Histogram,

    /// Tokens saved by ragged packing over a max-length layout
    pub padding_saved_tokens: IntCounter,
}

/// Adapter registry metrics
#[derive(Debug, Clone)]
pub struct LoraMetrics {
    /// Adapters currently visible in the registry
    pub adapters_loaded: IntGauge,

    /// Leases not yet released
    pub active_leases: IntGauge,

    /// Lookup tables built
    pub resolve_total: IntCounter,

    /// Slots that named an adapter the registry no longer has
    pub resolve_missing_total: IntCounter,

    /// Time removals spent waiting for leases to drain
    pub drain_wait: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Batch metrics
        let assembled_total =
            IntCounter::new("batch_assembled_total", "Total number of assembled batches").unwrap();

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Requests per assembled batch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]),
        )
        .unwrap();

        let batch_tokens = Histogram::with_opts(
            HistogramOpts::new("batch_tokens", "Tokens per assembled batch")
                .buckets(vec![1.0, 16.0, 64.0, 256.0, 1024.0, 4096.0, 16384.0]),
        )
        .unwrap();

        let padding_saved_tokens = IntCounter::new(
            "batch_padding_saved_tokens_total",
            "Tokens saved by ragged packing relative to max-length padding",
        )
        .unwrap();

        // LoRA metrics
        let adapters_loaded =
            IntGauge::new("lora_adapters_loaded", "Adapters currently registered").unwrap();

        let active_leases =
            IntGauge::new("lora_active_leases", "Adapter leases not yet released").unwrap();

        let resolve_total =
            IntCounter::new("lora_resolve_total", "Total number of LoRA lookup tables built")
                .unwrap();

        let resolve_missing_total = IntCounter::new(
            "lora_resolve_missing_total",
            "Slots whose adapter id was not registered at resolution time",
        )
        .unwrap();

        let drain_wait = Histogram::with_opts(
            HistogramOpts::new(
                "lora_drain_wait_seconds",
                "Time adapter removals waited for outstanding leases",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(assembled_total.clone())).unwrap();
        registry.register(Box::new(batch_size.clone())).unwrap();
        registry.register(Box::new(batch_tokens.clone())).unwrap();
        registry.register(Box::new(padding_saved_tokens.clone())).unwrap();

        registry.register(Box::new(adapters_loaded.clone())).unwrap();
        registry.register(Box::new(active_leases.clone())).unwrap();
        registry.register(Box::new(resolve_total.clone())).unwrap();
        registry.register(Box::new(resolve_missing_total.clone())).unwrap();
        registry.register(Box::new(drain_wait.clone())).unwrap();

        let batch = BatchMetrics {
            assembled_total,
            batch_size,
            batch_tokens,
            padding_saved_tokens,
        };

        let lora = LoraMetrics {
            adapters_loaded,
            active_leases,
            resolve_total,
            resolve_missing_total,
            drain_wait,
        };

        MetricsRegistry {
            registry,
            batch,
            lora,
            enabled: AtomicBool::new(true),
        }
    }

    /// Apply the observability settings
    pub fn configure(&self, config: &ObservabilityConfig) {
        self.set_enabled(config.enable_metrics);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether callers should record into this registry
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
