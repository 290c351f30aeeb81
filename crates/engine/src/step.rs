//! Per-step input preparation
//!
//! Combines batch assembly with LoRA resolution so that adapter slots line
//! up with packed batch slots.

use crate::batching::{BatchAssembler, PackedBatch, StepRequest};
use crate::lora::{LoraId, LoraLookupTable, LoraRegistry};
use batchcore_common::error::Result;
use tracing::debug;

/// Everything the forward pass reads for one step
#[derive(Debug)]
pub struct StepInputs {
    pub batch: PackedBatch,

    /// `None` when no request asked for an adapter
    pub lora: Option<LoraLookupTable>,
}

/// Assemble `requests` and resolve their adapters.
///
/// `lora_ids` is per request, in the same order as `requests`; negative ids
/// mean "no adapter".
pub fn prepare_step(
    assembler: &BatchAssembler,
    registry: &LoraRegistry,
    requests: &[StepRequest],
    lora_ids: &[LoraId],
) -> Result<StepInputs> {
    let batch = assembler.assemble(requests)?;
    let slot_ids = batch.gather_slots(lora_ids)?;

    let lora = if slot_ids.iter().any(|&id| id >= 0) {
        Some(registry.resolve(&slot_ids, &batch.slot_lengths())?)
    } else {
        None
    };

    debug!(
        "Prepared step: {} requests, {} tokens, LoRA {}",
        batch.batch_size(),
        batch.combo_tokens().len(),
        if lora.is_some() { "on" } else { "off" }
    );

    Ok(StepInputs { batch, lora })
}
