//! Per-step LoRA lookup tables.
//!
//! Given the adapter id of every batch slot, [`LoraRegistry::resolve`]
//! builds a dense (layer, module, slot) table of shared factor handles that
//! the forward pass indexes arithmetically.

use super::bundle::{LoraModule, LoraWeights};
use super::registry::{LoraId, LoraLease, LoraRegistry};
use batchcore_common::error::{BatchCoreError, Result};
use candle_core::Tensor;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Resolved adapter factors for one step.
///
/// Holds a lease on every adapter it references, so those adapters cannot be
/// destroyed, and their removal does not complete, until the table is dropped.
#[derive(Debug)]
pub struct LoraLookupTable {
    num_layers: usize,
    batch_size: usize,
    /// `[layer][module][slot]`, flattened
    slots: Vec<Option<LoraWeights>>,
    slot_adapters: Vec<Option<LoraId>>,
    input_lengths: Vec<i32>,
    leases: Vec<LoraLease>,
}

/// The per-slot view of one (layer, module)
#[derive(Debug, Clone, Copy)]
pub struct LoraOpInput<'a> {
    slots: &'a [Option<LoraWeights>],
}

impl<'a> LoraOpInput<'a> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slot carries an adapter for this op
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn get(&self, slot: usize) -> Option<&'a LoraWeights> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn lora_a(&self, slot: usize) -> Option<&'a Tensor> {
        self.get(slot).map(|w| &w.a)
    }

    pub fn lora_b(&self, slot: usize) -> Option<&'a Tensor> {
        self.get(slot).map(|w| &w.b)
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&'a LoraWeights>> + 'a {
        let slots = self.slots;
        slots.iter().map(Option::as_ref)
    }
}

impl LoraLookupTable {
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Per-slot factors for `module` at `layer`; `None` if `layer` is out of range
    pub fn op_input(&self, layer: usize, module: LoraModule) -> Option<LoraOpInput<'_>> {
        if layer >= self.num_layers {
            return None;
        }
        let start = (layer * LoraModule::COUNT + module.index()) * self.batch_size;
        Some(LoraOpInput {
            slots: &self.slots[start..start + self.batch_size],
        })
    }

    /// Adapter applied to `slot`, if one resolved
    pub fn slot_adapter(&self, slot: usize) -> Option<LoraId> {
        self.slot_adapters.get(slot).copied().flatten()
    }

    /// Token count of each slot
    pub fn input_lengths(&self) -> &[i32] {
        &self.input_lengths
    }

    /// Whether any slot resolved to an adapter
    pub fn has_adapters(&self) -> bool {
        !self.leases.is_empty()
    }

    /// Distinct adapters this table keeps alive
    pub fn adapter_ids(&self) -> Vec<LoraId> {
        self.leases.iter().map(LoraLease::lora_id).collect()
    }
}

impl LoraRegistry {
    /// Build the lookup table for a batch.
    ///
    /// `lora_ids` and `input_lengths` are per slot, in packed slot order.
    /// Negative ids and ids that are no longer registered resolve to "no
    /// adapter"; removals racing scheduling are expected.
    pub fn resolve(&self, lora_ids: &[LoraId], input_lengths: &[i32]) -> Result<LoraLookupTable> {
        if lora_ids.len() != input_lengths.len() {
            return Err(BatchCoreError::ShapeMismatch {
                ids: lora_ids.len(),
                lengths: input_lengths.len(),
            });
        }
        if let Some(slot) = input_lengths.iter().position(|&len| len < 0) {
            return Err(BatchCoreError::invalid_input(format!(
                "slot {} has negative input length {}",
                slot, input_lengths[slot]
            )));
        }

        let num_layers = self.num_layers();
        let batch_size = lora_ids.len();
        let mut slots = vec![None; num_layers * LoraModule::COUNT * batch_size];
        let mut slot_adapters = vec![None; batch_size];
        let mut leases: Vec<LoraLease> = Vec::new();
        // id -> index into `leases`, or None once known missing
        let mut seen: HashMap<LoraId, Option<usize>> = HashMap::new();
        let mut missing = 0u64;

        for (slot, &id) in lora_ids.iter().enumerate() {
            if id < 0 {
                continue;
            }
            let lease_idx = *seen.entry(id).or_insert_with(|| {
                self.get(id).map(|lease| {
                    leases.push(lease);
                    leases.len() - 1
                })
            });
            let Some(lease_idx) = lease_idx else {
                trace!("Slot {}: LoRA {} not registered, running base model", slot, id);
                missing += 1;
                continue;
            };

            let bundle = &leases[lease_idx];
            slot_adapters[slot] = Some(id);
            for layer in 0..bundle.num_layers() {
                for module in LoraModule::ALL {
                    if let Some(weights) = bundle.weights(layer, module) {
                        let idx = (layer * LoraModule::COUNT + module.index()) * batch_size + slot;
                        slots[idx] = Some(weights.clone());
                    }
                }
            }
        }

        if let Some(metrics) = self.metrics() {
            metrics.lora.resolve_total.inc();
            metrics.lora.resolve_missing_total.inc_by(missing);
        }
        debug!(
            "Resolved LoRA table: {} slots, {} adapters, {} missing",
            batch_size,
            leases.len(),
            missing
        );

        Ok(LoraLookupTable {
            num_layers,
            batch_size,
            slots,
            slot_adapters,
            input_lengths: input_lengths.to_vec(),
            leases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::bundle::LoraBundle;
    use crate::lora::registry::NO_LORA;
    use batchcore_common::config::LoraConfig;
    use batchcore_common::metrics::MetricsRegistry;
    use candle_core::{DType, Device};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const LAYERS: usize = 4;

    fn single_module_bundle(module: LoraModule) -> LoraBundle {
        let mut builder = LoraBundle::builder(LAYERS);
        for layer in 0..LAYERS {
            let a = Tensor::rand(0f32, 1f32, (64, 8), &Device::Cpu).unwrap();
            let b = Tensor::rand(0f32, 1f32, (8, 64), &Device::Cpu).unwrap();
            builder = builder.insert(layer, module, LoraWeights::new(a, b)).unwrap();
        }
        builder.build()
    }

    fn registry() -> LoraRegistry {
        let registry = LoraRegistry::new(LoraConfig::with_layers(LAYERS));
        registry.add(0, single_module_bundle(LoraModule::AttnQkv)).unwrap();
        registry.add(1, single_module_bundle(LoraModule::FfnW1)).unwrap();
        registry.add(2, single_module_bundle(LoraModule::FfnW2)).unwrap();
        registry
    }

    fn present(op: LoraOpInput<'_>) -> Vec<usize> {
        (0..op.len()).filter(|&slot| op.get(slot).is_some()).collect()
    }

    #[test]
    fn test_make_lookup_table() {
        let registry = registry();
        let ids = [NO_LORA, 0, 0, 1, 2, NO_LORA, NO_LORA, NO_LORA];
        let table = registry.resolve(&ids, &[1; 8]).unwrap();

        assert_eq!(table.batch_size(), 8);
        assert_eq!(table.num_layers(), LAYERS);
        for layer in 0..LAYERS {
            assert_eq!(present(table.op_input(layer, LoraModule::AttnQkv).unwrap()), vec![1, 2]);
            assert_eq!(present(table.op_input(layer, LoraModule::FfnW1).unwrap()), vec![3]);
            assert_eq!(present(table.op_input(layer, LoraModule::FfnW2).unwrap()), vec![4]);
            assert!(table.op_input(layer, LoraModule::AttnOut).unwrap().is_empty());
            assert!(table.op_input(layer, LoraModule::FfnW3).unwrap().is_empty());
        }
        assert!(table.op_input(LAYERS, LoraModule::AttnQkv).is_none());
        assert_eq!(table.slot_adapter(0), None);
        assert_eq!(table.slot_adapter(3), Some(1));
        assert_eq!(table.adapter_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_table_shares_bundle_tensors() {
        let registry = registry();
        let table = registry.resolve(&[1], &[5]).unwrap();
        let lease = registry.get(1).unwrap();

        for layer in 0..LAYERS {
            let op = table.op_input(layer, LoraModule::FfnW1).unwrap();
            let expected = lease.weights(layer, LoraModule::FfnW1).unwrap();
            assert_eq!(op.lora_a(0).unwrap().id(), expected.a.id());
            assert_eq!(op.lora_b(0).unwrap().id(), expected.b.id());
        }
    }

    #[test]
    fn test_single_populated_slot() {
        let registry = LoraRegistry::new(LoraConfig::with_layers(LAYERS));
        let a = Tensor::zeros((32, 4), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((4, 32), DType::F32, &Device::Cpu).unwrap();
        let bundle = LoraBundle::builder(LAYERS)
            .insert(2, LoraModule::AttnQkv, LoraWeights::new(a, b))
            .unwrap()
            .build();
        registry.add(11, bundle).unwrap();
        registry.add(12, single_module_bundle(LoraModule::FfnW3)).unwrap();

        let table = registry.resolve(&[12, 11, NO_LORA], &[3, 1, 1]).unwrap();
        for layer in 0..LAYERS {
            for module in LoraModule::ALL {
                let op = table.op_input(layer, module).unwrap();
                let expect_slot1 = layer == 2 && module == LoraModule::AttnQkv;
                assert_eq!(op.get(1).is_some(), expect_slot1, "layer {} {}", layer, module);
                assert!(op.get(2).is_none());
            }
        }
    }

    #[test]
    fn test_removed_adapter_resolves_absent() {
        let registry = registry();
        registry.remove(1).unwrap();

        let table = registry.resolve(&[0, 1, 1], &[4, 1, 1]).unwrap();
        for layer in 0..LAYERS {
            assert!(table.op_input(layer, LoraModule::FfnW1).unwrap().is_empty());
            assert_eq!(present(table.op_input(layer, LoraModule::AttnQkv).unwrap()), vec![0]);
        }
        assert_eq!(table.slot_adapter(1), None);
        assert_eq!(table.adapter_ids(), vec![0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let registry = registry();
        assert!(matches!(
            registry.resolve(&[0, 1], &[1]),
            Err(BatchCoreError::ShapeMismatch { ids: 2, lengths: 1 })
        ));
        assert!(registry.resolve(&[0], &[-1]).is_err());
    }

    #[test]
    fn test_empty_and_adapterless_batches() {
        let registry = registry();

        let table = registry.resolve(&[], &[]).unwrap();
        assert_eq!(table.batch_size(), 0);
        assert!(table.op_input(0, LoraModule::AttnQkv).unwrap().is_empty());

        let table = registry.resolve(&[NO_LORA, 99], &[2, 1]).unwrap();
        assert!(!table.has_adapters());
        assert_eq!(table.input_lengths(), &[2, 1]);
    }

    #[test]
    fn test_resolve_metrics_follow_enable_flag() {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = registry().with_metrics(Arc::clone(&metrics));

        metrics.set_enabled(false);
        registry.resolve(&[0, 99], &[1, 1]).unwrap();
        assert_eq!(metrics.lora.resolve_total.get(), 0);
        assert_eq!(metrics.lora.resolve_missing_total.get(), 0);

        metrics.set_enabled(true);
        registry.resolve(&[0, 99, 98], &[1, 1, 1]).unwrap();
        assert_eq!(metrics.lora.resolve_total.get(), 1);
        assert_eq!(metrics.lora.resolve_missing_total.get(), 2);
    }

    #[test]
    fn test_table_blocks_removal_until_dropped() {
        let registry = Arc::new(registry());
        let table = registry.resolve(&[2, 2], &[1, 1]).unwrap();
        assert_eq!(registry.lease_count(2), Some(1));

        let remover = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.remove(2))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!remover.is_finished());
        // The table's factors are still readable while removal waits.
        assert!(table.op_input(0, LoraModule::FfnW2).unwrap().lora_a(1).is_some());

        drop(table);
        assert!(remover.join().unwrap().unwrap());
        assert!(!registry.exists(2));
    }
}
