//! LoRA adapter support
//!
//! - [`bundle`]: immutable per-layer, per-module adapter weights
//! - [`registry`]: concurrent id -> bundle store with leases and drain-on-remove
//! - [`resolve`]: per-step (layer, module, slot) lookup tables

pub mod bundle;
pub mod registry;
pub mod resolve;

pub use bundle::{LoraBundle, LoraBundleBuilder, LoraModule, LoraWeights};
pub use registry::{LoraId, LoraLease, LoraRegistry, NO_LORA};
pub use resolve::{LoraLookupTable, LoraOpInput};
