//! Ragged batch assembly
//!
//! Packs one inference step's requests, some still consuming their prompt
//! (context phase) and some emitting a single token (decode phase), into one
//! unpadded token buffer plus the boundary and offset tables the attention
//! kernels index with.

use batchcore_common::config::BatchingConfig;
use batchcore_common::error::{BatchCoreError, Result};
use batchcore_common::metrics::{MetricsRegistry, METRICS};
use std::sync::Arc;
use tracing::{debug, trace};

/// Token id as consumed by the embedding kernels
pub type TokenId = i32;

/// One request's contribution to the current step.
///
/// The phase is implied by the lengths: a request that already has a total
/// sequence length is decoding and contributes exactly its latest token;
/// otherwise it contributes its unconsumed prompt tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    /// Unconsumed prompt tokens (context) or the current token (decode)
    pub tokens: Vec<TokenId>,

    /// Total tokens in the sequence so far; set once decoding starts
    pub sequence_length: Option<usize>,
}

/// Phase of a request within one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Prefill: contributes `prompt_length` tokens
    Context { prompt_length: usize },

    /// Generation: contributes one token
    Decode { sequence_length: usize },
}

impl StepRequest {
    /// A request still consuming its prompt
    pub fn context(tokens: Vec<TokenId>) -> Self {
        Self {
            tokens,
            sequence_length: None,
        }
    }

    /// A request generating one token at a time
    pub fn decode(token: TokenId, sequence_length: usize) -> Self {
        Self {
            tokens: vec![token],
            sequence_length: Some(sequence_length),
        }
    }

    /// Infer the phase, rejecting descriptors that fit neither.
    pub fn phase(&self) -> Result<Phase> {
        match self.sequence_length {
            Some(0) => Err(BatchCoreError::invalid_input(
                "decode request with zero sequence length",
            )),
            Some(sequence_length) if self.tokens.len() == 1 => {
                Ok(Phase::Decode { sequence_length })
            }
            Some(_) => Err(BatchCoreError::invalid_input(format!(
                "decode request must carry exactly one token, got {}",
                self.tokens.len()
            ))),
            None if self.tokens.is_empty() => Err(BatchCoreError::invalid_input(
                "request has neither prompt tokens nor a sequence length",
            )),
            None => Ok(Phase::Context {
                prompt_length: self.tokens.len(),
            }),
        }
    }

    fn is_decode(&self) -> bool {
        self.sequence_length.is_some()
    }
}

/// Packed description of one step's batch.
///
/// Slots are numbered context requests first, then decode requests, each
/// partition in the caller's order. Every per-slot structure downstream,
/// including the LoRA lookup table, uses this numbering.
///
/// Besides the four kernel buffers (`combo_tokens`, `cu_seqlens`,
/// `padding_offset`, `sequence_lengths`), assembly allocates `slot_order`,
/// one entry per request, so per-request data can be permuted into slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBatch {
    combo_tokens: Vec<TokenId>,
    cu_seqlens: Vec<i32>,
    padding_offset: Vec<i32>,
    sequence_lengths: Vec<i32>,
    slot_order: Vec<usize>,
    context_batch_size: usize,
    context_max_seq_len: usize,
    decoder_batch_size: usize,
    decoder_max_seq_len: usize,
}

impl PackedBatch {
    /// All context tokens in slot order, then one token per decode slot
    pub fn combo_tokens(&self) -> &[TokenId] {
        &self.combo_tokens
    }

    /// Cumulative context token boundaries, leading 0, `context_batch_size + 1` entries
    pub fn cu_seqlens(&self) -> &[i32] {
        &self.cu_seqlens
    }

    /// Per-token padding saved by ragged packing; one entry per combo token
    pub fn padding_offset(&self) -> &[i32] {
        &self.padding_offset
    }

    /// The context prefix of [`padding_offset`](Self::padding_offset)
    pub fn context_padding_offset(&self) -> &[i32] {
        &self.padding_offset[..self.context_token_count()]
    }

    /// Total sequence length of each decode slot
    pub fn sequence_lengths(&self) -> &[i32] {
        &self.sequence_lengths
    }

    /// Caller's request index for each slot
    pub fn slot_order(&self) -> &[usize] {
        &self.slot_order
    }

    pub fn context_batch_size(&self) -> usize {
        self.context_batch_size
    }

    pub fn context_max_seq_len(&self) -> usize {
        self.context_max_seq_len
    }

    pub fn decoder_batch_size(&self) -> usize {
        self.decoder_batch_size
    }

    pub fn decoder_max_seq_len(&self) -> usize {
        self.decoder_max_seq_len
    }

    /// Number of slots (requests) in the batch
    pub fn batch_size(&self) -> usize {
        self.context_batch_size + self.decoder_batch_size
    }

    /// Check if the batch has no requests
    pub fn is_empty(&self) -> bool {
        self.batch_size() == 0
    }

    /// Number of packed context tokens
    pub fn context_token_count(&self) -> usize {
        self.cu_seqlens.last().copied().unwrap_or(0) as usize
    }

    /// Tokens each slot contributes this step (prompt length or 1)
    pub fn slot_lengths(&self) -> Vec<i32> {
        self.cu_seqlens
            .windows(2)
            .map(|w| w[1] - w[0])
            .chain(std::iter::repeat(1).take(self.decoder_batch_size))
            .collect()
    }

    /// Reorder a per-request buffer into slot order.
    ///
    /// Used to line up externally produced per-request data, such as the
    /// routing layer's adapter assignment, with the packed slots.
    pub fn gather_slots<T: Copy>(&self, per_request: &[T]) -> Result<Vec<T>> {
        if per_request.len() != self.slot_order.len() {
            return Err(BatchCoreError::invalid_input(format!(
                "expected {} per-request values, got {}",
                self.slot_order.len(),
                per_request.len()
            )));
        }
        Ok(self.slot_order.iter().map(|&idx| per_request[idx]).collect())
    }
}

/// Builds [`PackedBatch`]es under configured size limits
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    config: BatchingConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Default for BatchAssembler {
    fn default() -> Self {
        Self::new(BatchingConfig::default())
    }
}

impl BatchAssembler {
    /// Create a new batch assembler recording into the global registry
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            metrics: Arc::clone(&METRICS),
        }
    }

    /// Record into `metrics` instead of the global registry
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Pack `requests` into a ragged batch.
    ///
    /// Deterministic in the input order and linear in the number of tokens.
    /// Fails without producing anything when a descriptor is malformed or a
    /// configured limit is exceeded.
    pub fn assemble(&self, requests: &[StepRequest]) -> Result<PackedBatch> {
        let mut slot_order = Vec::with_capacity(requests.len());
        let mut context_tokens = 0usize;
        let mut context_max_seq_len = 0usize;
        let mut decoder_max_seq_len = 0usize;

        for (idx, request) in requests.iter().enumerate() {
            match request.phase()? {
                Phase::Context { prompt_length } => {
                    self.check_seq_len(idx, prompt_length)?;
                    slot_order.push(idx);
                    context_tokens += prompt_length;
                    context_max_seq_len = context_max_seq_len.max(prompt_length);
                }
                Phase::Decode { sequence_length } => {
                    self.check_seq_len(idx, sequence_length)?;
                    decoder_max_seq_len = decoder_max_seq_len.max(sequence_length);
                }
            }
        }

        let context_batch_size = slot_order.len();
        let decoder_batch_size = requests.len() - context_batch_size;
        let total_tokens = context_tokens + decoder_batch_size;
        self.check_limits(context_batch_size, decoder_batch_size, total_tokens)?;

        slot_order.extend(
            requests
                .iter()
                .enumerate()
                .filter(|(_, request)| request.is_decode())
                .map(|(idx, _)| idx),
        );

        let mut combo_tokens = Vec::with_capacity(total_tokens);
        let mut cu_seqlens = Vec::with_capacity(context_batch_size + 1);
        let mut padding_offset = Vec::with_capacity(total_tokens);
        let mut sequence_lengths = Vec::with_capacity(decoder_batch_size);

        // Limits guarantee every length and the running sums fit in i32.
        let context_max = context_max_seq_len as i32;
        let decoder_max = decoder_max_seq_len as i32;
        let mut boundary = 0i32;
        let mut saved = 0i32;
        cu_seqlens.push(boundary);

        for &idx in &slot_order[..context_batch_size] {
            let tokens = &requests[idx].tokens;
            let len = tokens.len() as i32;
            combo_tokens.extend_from_slice(tokens);
            padding_offset.extend(std::iter::repeat(saved).take(tokens.len()));
            boundary += len;
            cu_seqlens.push(boundary);
            saved += context_max - len;
        }
        let context_saved = saved;

        for &idx in &slot_order[context_batch_size..] {
            let request = &requests[idx];
            combo_tokens.push(request.tokens[0]);
            padding_offset.push(saved);
            sequence_lengths.push(request.sequence_length.unwrap_or(1) as i32);
            trace!("Decode slot for request {}: offset {}", idx, saved);
            saved += decoder_max - 1;
        }

        debug!(
            "Assembled batch: {} context ({} tokens, max {}), {} decode (max {})",
            context_batch_size,
            context_tokens,
            context_max_seq_len,
            decoder_batch_size,
            decoder_max_seq_len
        );

        if self.metrics.is_enabled() {
            let batch = &self.metrics.batch;
            batch.assembled_total.inc();
            batch.batch_size.observe(requests.len() as f64);
            batch.batch_tokens.observe(total_tokens as f64);
            batch.padding_saved_tokens.inc_by(context_saved as u64);
        }

        Ok(PackedBatch {
            combo_tokens,
            cu_seqlens,
            padding_offset,
            sequence_lengths,
            slot_order,
            context_batch_size,
            context_max_seq_len,
            decoder_batch_size,
            decoder_max_seq_len,
        })
    }

    fn check_seq_len(&self, idx: usize, len: usize) -> Result<()> {
        if len > self.config.max_seq_len {
            return Err(BatchCoreError::invalid_input(format!(
                "request {} has length {}, above max_seq_len {}",
                idx, len, self.config.max_seq_len
            )));
        }
        Ok(())
    }

    fn check_limits(&self, context: usize, decode: usize, tokens: usize) -> Result<()> {
        if context > self.config.max_context_batch_size {
            return Err(BatchCoreError::invalid_input(format!(
                "{} context requests exceed max_context_batch_size {}",
                context, self.config.max_context_batch_size
            )));
        }
        if decode > self.config.max_decode_batch_size {
            return Err(BatchCoreError::invalid_input(format!(
                "{} decode requests exceed max_decode_batch_size {}",
                decode, self.config.max_decode_batch_size
            )));
        }
        if tokens > self.config.max_batch_tokens || tokens > i32::MAX as usize {
            return Err(BatchCoreError::invalid_input(format!(
                "{} tokens exceed max_batch_tokens {}",
                tokens, self.config.max_batch_tokens
            )));
        }
        // The offset table accumulates up to max_len per slot.
        let max_len = self.config.max_seq_len;
        if (context + decode).saturating_mul(max_len) > i32::MAX as usize {
            return Err(BatchCoreError::invalid_input(format!(
                "{} requests of up to {} tokens overflow the 32-bit offset table",
                context + decode,
                max_len
            )));
        }
        Ok(())
    }
}
