//! Narrow interfaces to the model and the sampler.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor, D};

use crate::paged_attention::ModelConfigLike;
use crate::scheduler::ScheduledBatch;

/// Runs the forward pass over a scheduled batch.
///
/// Before computing, the executor performs `batch.blocks_to_copy` on its KV cache and
/// writes the KV entries of every input token to the slot given by its slot mapping.
pub trait ModelExecutor: Send {
    fn device(&self) -> &Device;

    /// Cache layout used to size the blocks.
    fn model_config(&self) -> &dyn ModelConfigLike;

    /// Logits of the next token for every row of the batch, shape `[num_seqs, vocab]`,
    /// in batch order.
    fn forward(&mut self, batch: &ScheduledBatch) -> anyhow::Result<Tensor>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledToken {
    pub token: u32,
    pub is_eos: bool,
}

pub trait Sampler: Send {
    /// Sample from the logits of one sequence, shape `[vocab]`.
    fn sample(&mut self, logits: &Tensor) -> anyhow::Result<SampledToken>;
}

/// Argmax sampling with a set of end-of-sequence tokens.
#[derive(Clone, Debug)]
pub struct GreedySampler {
    eos_token_ids: HashSet<u32>,
}

impl GreedySampler {
    pub fn new(eos_token_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            eos_token_ids: eos_token_ids.into_iter().collect(),
        }
    }
}

impl Sampler for GreedySampler {
    fn sample(&mut self, logits: &Tensor) -> anyhow::Result<SampledToken> {
        let token = logits
            .to_dtype(DType::F32)?
            .argmax(D::Minus1)?
            .to_scalar::<u32>()?;
        Ok(SampledToken {
            token,
            is_eos: self.eos_token_ids.contains(&token),
        })
    }
}
