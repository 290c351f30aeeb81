//! BatchCore Engine
//!
//! Per-step request batching and LoRA adapter injection for an LLM
//! inference engine: packs context and decode requests into one ragged batch
//! and resolves, per request and per layer, which adapter weights apply while
//! adapters are hot-added and hot-removed.

pub mod batching;
pub mod lora;
pub mod step;

pub use batching::{BatchAssembler, PackedBatch, Phase, StepRequest, TokenId};
pub use lora::{
    LoraBundle, LoraId, LoraLease, LoraLookupTable, LoraModule, LoraOpInput, LoraRegistry,
    LoraWeights, NO_LORA,
};
pub use step::{prepare_step, StepInputs};

pub use candle_core::Tensor;
