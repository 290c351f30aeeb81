//! Adapter weight bundles.
//!
//! A bundle holds, for every layer of the base model, the low-rank factor
//! pair of each adapted module. Module names are resolved to [`LoraModule`]
//! once, at construction, so lookups afterwards are plain indexing.

use batchcore_common::error::{BatchCoreError, Result};
use candle_core::Tensor;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Weight-bearing projections an adapter can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LoraModule {
    /// Fused query/key/value projection
    AttnQkv,
    /// Attention output projection
    AttnOut,
    /// FFN gate projection
    FfnW1,
    /// FFN down projection
    FfnW2,
    /// FFN up projection
    FfnW3,
}

impl LoraModule {
    /// Number of distinct modules
    pub const COUNT: usize = 5;

    /// All modules in index order
    pub const ALL: [LoraModule; Self::COUNT] = [
        LoraModule::AttnQkv,
        LoraModule::AttnOut,
        LoraModule::FfnW1,
        LoraModule::FfnW2,
        LoraModule::FfnW3,
    ];

    /// Dense index in `0..COUNT`
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoraModule::AttnQkv => "attn_qkv",
            LoraModule::AttnOut => "attn_o",
            LoraModule::FfnW1 => "ffn_w1",
            LoraModule::FfnW2 => "ffn_w2",
            LoraModule::FfnW3 => "ffn_w3",
        }
    }
}

impl fmt::Display for LoraModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoraModule {
    type Err = BatchCoreError;

    /// Accepts the canonical name with or without a trailing `_w`.
    fn from_str(s: &str) -> Result<Self> {
        let name = match s {
            "attn_qkv_w" | "attn_o_w" => &s[..s.len() - 2],
            other => other,
        };
        LoraModule::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| BatchCoreError::invalid_input(format!("unknown LoRA module {:?}", s)))
    }
}

/// Low-rank factors for one (layer, module)
///
/// Tensors are reference-counted handles; cloning shares the storage.
#[derive(Debug, Clone)]
pub struct LoraWeights {
    pub a: Tensor,
    pub b: Tensor,
    pub a_scale: Option<Tensor>,
    pub b_scale: Option<Tensor>,
}

impl LoraWeights {
    pub fn new(a: Tensor, b: Tensor) -> Self {
        Self {
            a,
            b,
            a_scale: None,
            b_scale: None,
        }
    }

    /// Attach per-factor scale tensors (quantised factors)
    pub fn with_scales(mut self, a_scale: Tensor, b_scale: Tensor) -> Self {
        self.a_scale = Some(a_scale);
        self.b_scale = Some(b_scale);
        self
    }
}

type LayerSlots = [Option<LoraWeights>; LoraModule::COUNT];

/// Immutable per-layer, per-module adapter weights
#[derive(Debug)]
pub struct LoraBundle {
    layers: Vec<LayerSlots>,
}

impl LoraBundle {
    /// Start a bundle for a model with `num_layers` layers
    pub fn builder(num_layers: usize) -> LoraBundleBuilder {
        LoraBundleBuilder {
            layers: (0..num_layers).map(|_| empty_layer()).collect(),
        }
    }

    /// Build from per-layer `module name -> tensor` maps for each factor.
    ///
    /// Both lists must cover the same layers and name the same modules in
    /// each layer.
    pub fn from_layer_maps(
        lora_a: Vec<HashMap<String, Tensor>>,
        mut lora_b: Vec<HashMap<String, Tensor>>,
    ) -> Result<Self> {
        if lora_a.len() != lora_b.len() {
            return Err(BatchCoreError::invalid_input(format!(
                "LoRA A covers {} layers but B covers {}",
                lora_a.len(),
                lora_b.len()
            )));
        }

        let mut builder = Self::builder(lora_a.len());
        for (layer, (a_map, b_map)) in lora_a.into_iter().zip(lora_b.iter_mut()).enumerate() {
            if a_map.len() != b_map.len() {
                return Err(BatchCoreError::invalid_input(format!(
                    "layer {}: {} A factors but {} B factors",
                    layer,
                    a_map.len(),
                    b_map.len()
                )));
            }
            for (name, a) in a_map {
                let b = b_map.remove(&name).ok_or_else(|| {
                    BatchCoreError::invalid_input(format!(
                        "layer {}: module {} has an A factor but no B factor",
                        layer, name
                    ))
                })?;
                let module = name.parse()?;
                builder = builder.insert(layer, module, LoraWeights::new(a, b))?;
            }
        }
        Ok(builder.build())
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Factors for `module` at `layer`, if the adapter defines them
    pub fn weights(&self, layer: usize, module: LoraModule) -> Option<&LoraWeights> {
        self.layers.get(layer)?[module.index()].as_ref()
    }

    /// Number of (layer, module) pairs with weights
    pub fn len(&self) -> usize {
        self.layers
            .iter()
            .map(|slots| slots.iter().filter(|w| w.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Modules adapted in at least one layer
    pub fn target_modules(&self) -> Vec<LoraModule> {
        LoraModule::ALL
            .into_iter()
            .filter(|m| self.layers.iter().any(|slots| slots[m.index()].is_some()))
            .collect()
    }
}

/// Incremental constructor for [`LoraBundle`]
#[derive(Debug)]
pub struct LoraBundleBuilder {
    layers: Vec<LayerSlots>,
}

impl LoraBundleBuilder {
    /// Set the factors for (`layer`, `module`), replacing earlier ones
    pub fn insert(
        mut self,
        layer: usize,
        module: LoraModule,
        weights: LoraWeights,
    ) -> Result<Self> {
        let num_layers = self.layers.len();
        let slots = self.layers.get_mut(layer).ok_or_else(|| {
            BatchCoreError::invalid_input(format!(
                "layer {} out of range for a {}-layer bundle",
                layer, num_layers
            ))
        })?;
        slots[module.index()] = Some(weights);
        Ok(self)
    }

    pub fn build(self) -> LoraBundle {
        LoraBundle {
            layers: self.layers,
        }
    }
}

fn empty_layer() -> LayerSlots {
    std::array::from_fn(|_| None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn factor(rows: usize, cols: usize) -> Tensor {
        Tensor::zeros((rows, cols), DType::F32, &Device::Cpu).unwrap()
    }

    fn layer_maps(
        num_layers: usize,
        modules: &[&str],
    ) -> (Vec<HashMap<String, Tensor>>, Vec<HashMap<String, Tensor>>) {
        let mut a_maps = vec![HashMap::new(); num_layers];
        let mut b_maps = vec![HashMap::new(); num_layers];
        for layer in 0..num_layers {
            for module in modules {
                a_maps[layer].insert(module.to_string(), factor(64, 8));
                b_maps[layer].insert(module.to_string(), factor(8, 64));
            }
        }
        (a_maps, b_maps)
    }

    #[test]
    fn test_module_names() {
        for module in LoraModule::ALL {
            assert_eq!(module.as_str().parse::<LoraModule>().unwrap(), module);
            assert_eq!(LoraModule::ALL[module.index()], module);
        }
        assert_eq!("attn_qkv_w".parse::<LoraModule>().unwrap(), LoraModule::AttnQkv);
        assert!("lm_head".parse::<LoraModule>().is_err());
    }

    #[test]
    fn test_from_layer_maps() {
        let (a, b) = layer_maps(4, &["attn_qkv", "ffn_w2"]);
        let bundle = LoraBundle::from_layer_maps(a, b).unwrap();

        assert_eq!(bundle.num_layers(), 4);
        assert_eq!(bundle.len(), 8);
        assert_eq!(
            bundle.target_modules(),
            vec![LoraModule::AttnQkv, LoraModule::FfnW2]
        );
        assert!(bundle.weights(3, LoraModule::FfnW2).is_some());
        assert!(bundle.weights(3, LoraModule::FfnW1).is_none());
        assert!(bundle.weights(4, LoraModule::AttnQkv).is_none());
    }

    #[test]
    fn test_from_layer_maps_shares_tensors() {
        let (a, b) = layer_maps(1, &["attn_o"]);
        let a_id = a[0]["attn_o"].id();
        let bundle = LoraBundle::from_layer_maps(a, b).unwrap();
        assert_eq!(bundle.weights(0, LoraModule::AttnOut).unwrap().a.id(), a_id);
    }

    #[test]
    fn test_from_layer_maps_rejects_mismatch() {
        let (a, _) = layer_maps(2, &["ffn_w1"]);
        let (_, b) = layer_maps(3, &["ffn_w1"]);
        assert!(LoraBundle::from_layer_maps(a, b).is_err());

        let (a, _) = layer_maps(1, &["ffn_w1"]);
        let (_, b) = layer_maps(1, &["ffn_w3"]);
        assert!(LoraBundle::from_layer_maps(a, b).is_err());

        let (a, b) = layer_maps(1, &["rotary"]);
        assert!(LoraBundle::from_layer_maps(a, b).is_err());
    }

    #[test]
    fn test_empty_bundle() {
        let bundle =
            LoraBundle::from_layer_maps(vec![HashMap::new()], vec![HashMap::new()]).unwrap();
        assert_eq!(bundle.num_layers(), 1);
        assert!(bundle.is_empty());
        assert!(bundle.target_modules().is_empty());
    }

    #[test]
    fn test_builder_with_scales() {
        let weights = LoraWeights::new(factor(16, 4), factor(4, 16))
            .with_scales(factor(1, 4), factor(1, 16));
        let bundle = LoraBundle::builder(3)
            .insert(2, LoraModule::AttnQkv, weights)
            .unwrap()
            .build();

        let stored = bundle.weights(2, LoraModule::AttnQkv).unwrap();
        assert!(stored.a_scale.is_some());
        assert!(stored.b_scale.is_some());
        assert_eq!(bundle.len(), 1);

        let out_of_range = LoraBundle::builder(3).insert(
            3,
            LoraModule::AttnQkv,
            LoraWeights::new(factor(1, 1), factor(1, 1)),
        );
        assert!(out_of_range.is_err());
    }
}
