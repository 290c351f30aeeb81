//! Concurrent adapter registry.
//!
//! Adapters are hot-added and hot-removed while inference steps hold
//! [`LoraLease`]s on them. Removal revokes visibility under a short
//! exclusive write, then waits outside the map lock until every lease taken
//! before the erase has been released.

use super::bundle::LoraBundle;
use batchcore_common::config::LoraConfig;
use batchcore_common::error::{BatchCoreError, Result};
use batchcore_common::metrics::{LatencyTimer, MetricsRegistry, METRICS};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Externally assigned adapter identifier
pub type LoraId = i64;

/// Slot value meaning "no adapter"
pub const NO_LORA: LoraId = -1;

/// Broadcast used by leases to wake blocked removals
#[derive(Debug, Default)]
struct DrainSignal {
    lock: Mutex<()>,
    released: Condvar,
}

impl DrainSignal {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.released.notify_all();
    }
}

/// Registry of live adapters keyed by [`LoraId`]
#[derive(Debug)]
pub struct LoraRegistry {
    config: LoraConfig,

    /// Map shape; bundles themselves are immutable
    adapters: RwLock<HashMap<LoraId, Arc<LoraBundle>>>,

    /// Serializes removals through their drain wait
    remove_lock: Mutex<()>,

    drain: Arc<DrainSignal>,
    metrics: Arc<MetricsRegistry>,
}

impl LoraRegistry {
    /// Create a new, empty registry
    pub fn new(config: LoraConfig) -> Self {
        Self {
            config,
            adapters: RwLock::new(HashMap::new()),
            remove_lock: Mutex::new(()),
            drain: Arc::new(DrainSignal::default()),
            metrics: Arc::clone(&METRICS),
        }
    }

    /// Record into `metrics` instead of the global registry
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The registry to record into, if recording is on
    pub(crate) fn metrics(&self) -> Option<&MetricsRegistry> {
        Some(self.metrics.as_ref()).filter(|m| m.is_enabled())
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Layers every lookup table built by this registry covers
    pub fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    /// Insert or replace the adapter for `id`.
    ///
    /// Leases on a replaced bundle stay valid until released; new lookups see
    /// the new bundle immediately.
    pub fn add(&self, id: LoraId, bundle: LoraBundle) -> Result<()> {
        if id < 0 {
            return Err(BatchCoreError::invalid_input(format!(
                "LoRA id {} is negative; negative ids mean \"no adapter\"",
                id
            )));
        }
        if bundle.num_layers() > self.config.num_layers {
            return Err(BatchCoreError::invalid_input(format!(
                "LoRA {} covers {} layers, model has {}",
                id,
                bundle.num_layers(),
                self.config.num_layers
            )));
        }

        let modules = bundle.len();
        let bundle = Arc::new(bundle);
        let replaced = {
            let mut adapters = self.adapters.write();
            let max = self.config.max_adapters;
            if max > 0 && adapters.len() >= max && !adapters.contains_key(&id) {
                return Err(BatchCoreError::capacity_exceeded(format!(
                    "registry already holds {} adapters",
                    max
                )));
            }
            let replaced = adapters.insert(id, bundle);
            if let Some(metrics) = self.metrics() {
                metrics.lora.adapters_loaded.set(adapters.len() as i64);
            }
            replaced
        };

        if replaced.is_some() {
            info!("Replaced LoRA adapter {} ({} weighted modules)", id, modules);
        } else {
            info!("Added LoRA adapter {} ({} weighted modules)", id, modules);
        }
        Ok(())
    }

    /// Whether `id` is currently visible
    pub fn exists(&self, id: LoraId) -> bool {
        self.adapters.read().contains_key(&id)
    }

    /// Lease the bundle for `id`, or `None` if it is not registered
    pub fn get(&self, id: LoraId) -> Option<LoraLease> {
        let bundle = self.adapters.read().get(&id).cloned()?;
        let metrics = self.metrics().is_some().then(|| Arc::clone(&self.metrics));
        Some(LoraLease::new(id, bundle, Arc::clone(&self.drain), metrics))
    }

    /// Remove `id`, blocking until outstanding leases on it are released.
    ///
    /// Returns `Ok(false)` when `id` was not registered. Must not be called
    /// while the calling thread holds a lease on `id`; with no
    /// `drain_timeout_ms` configured that never returns.
    pub fn remove(&self, id: LoraId) -> Result<bool> {
        let _serial = self.remove_lock.lock();

        let bundle = {
            let mut adapters = self.adapters.write();
            let bundle = adapters.remove(&id);
            if let Some(metrics) = self.metrics() {
                metrics.lora.adapters_loaded.set(adapters.len() as i64);
            }
            bundle
        };

        let Some(bundle) = bundle else {
            debug!("LoRA adapter {} not registered, nothing to remove", id);
            return Ok(false);
        };

        match self.metrics() {
            Some(metrics) => metrics.lora.drain_wait.time(|| self.wait_for_drain(id, &bundle))?,
            None => self.wait_for_drain(id, &bundle)?,
        }
        drop(bundle);

        info!("Removed LoRA adapter {}", id);
        Ok(true)
    }

    /// [`remove`](Self::remove) on tokio's blocking pool
    pub async fn remove_async(self: &Arc<Self>, id: LoraId) -> Result<bool> {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || registry.remove(id))
            .await
            .map_err(|e| BatchCoreError::internal(format!("LoRA removal task failed: {}", e)))?
    }

    /// Outstanding leases on the live bundle for `id`
    pub fn lease_count(&self, id: LoraId) -> Option<usize> {
        self.adapters
            .read()
            .get(&id)
            .map(|bundle| Arc::strong_count(bundle) - 1)
    }

    /// Registered adapter ids, ascending
    pub fn adapter_ids(&self) -> Vec<LoraId> {
        let mut ids: Vec<_> = self.adapters.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Block until `bundle` is owned by the caller alone.
    fn wait_for_drain(&self, id: LoraId, bundle: &Arc<LoraBundle>) -> Result<()> {
        let start = Instant::now();
        let interval = self.config.drain_warn_interval();
        let deadline = self.config.drain_timeout().map(|timeout| start + timeout);

        let mut guard = self.drain.lock.lock();
        while Arc::strong_count(bundle) > 1 {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let outstanding = Arc::strong_count(bundle) - 1;
                        warn!(
                            "Giving up on LoRA adapter {} after {:?}: {} lease(s) outstanding",
                            id,
                            start.elapsed(),
                            outstanding
                        );
                        return Err(BatchCoreError::DrainTimeout {
                            lora_id: id,
                            outstanding,
                        });
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };

            if self.drain.released.wait_for(&mut guard, wait).timed_out() {
                warn!(
                    "Removal of LoRA adapter {} waiting {:?} on {} lease(s)",
                    id,
                    start.elapsed(),
                    Arc::strong_count(bundle) - 1
                );
            }
        }
        drop(guard);

        debug!("LoRA adapter {} drained after {:?}", id, start.elapsed());
        Ok(())
    }
}

/// Scoped shared borrow of one adapter bundle.
///
/// Keeps the bundle alive independently of the registry map. Dropping the
/// lease wakes any removal waiting on the bundle.
#[derive(Debug)]
pub struct LoraLease {
    lora_id: LoraId,
    bundle: Option<Arc<LoraBundle>>,
    drain: Arc<DrainSignal>,

    /// Set when the acquisition was counted, so the release is too
    metrics: Option<Arc<MetricsRegistry>>,
}

impl LoraLease {
    fn new(
        lora_id: LoraId,
        bundle: Arc<LoraBundle>,
        drain: Arc<DrainSignal>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        if let Some(metrics) = &metrics {
            metrics.lora.active_leases.inc();
        }
        Self {
            lora_id,
            bundle: Some(bundle),
            drain,
            metrics,
        }
    }

    pub fn lora_id(&self) -> LoraId {
        self.lora_id
    }

    pub fn bundle(&self) -> &LoraBundle {
        self.bundle
            .as_deref()
            .expect("lease holds its bundle until dropped")
    }

    /// Whether both leases borrow the very same bundle
    pub fn same_bundle(&self, other: &LoraLease) -> bool {
        match (&self.bundle, &other.bundle) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Deref for LoraLease {
    type Target = LoraBundle;

    fn deref(&self) -> &LoraBundle {
        self.bundle()
    }
}

impl Drop for LoraLease {
    fn drop(&mut self) {
        // Release the reference before waking removers so they observe it.
        drop(self.bundle.take());
        if let Some(metrics) = &self.metrics {
            metrics.lora.active_leases.dec();
        }
        self.drain.notify();
    }
}
