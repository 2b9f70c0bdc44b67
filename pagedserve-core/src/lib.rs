#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
//! Paged KV cache management and continuous-batching scheduling for LLM serving.
//!
//! The [`Engine`] owns a single fixed pool of KV cache blocks. Requests are admitted by
//! priority tier, batched as either all-prefill or all-decode steps, and preempted (then
//! recomputed) when the pool runs out. The model, the sampler and the tokenizer are
//! external collaborators behind [`ModelExecutor`], [`Sampler`] and [`TokenizerLike`].

use std::sync::atomic::AtomicBool;

mod config;
mod engine;
mod error;
mod executor;
pub mod paged_attention;
mod response;
pub mod scheduler;
mod sequence;
mod tokenizer;
mod utils;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, DEFAULT_NUM_BLOCKS};
pub use engine::{Engine, EngineHandle, IntervalLogger, Prompt, RequestInput};
pub use error::{Error, Result};
pub use executor::{GreedySampler, ModelExecutor, SampledToken, Sampler};
pub use paged_attention::{CacheConfig, CacheStats, ModelConfigLike, ModelConfigMetadata};
pub use response::{GenerationOutput, StepOutput};
pub use scheduler::{BatchKind, ScheduledBatch, ScheduledSequence};
pub use sequence::{RequestId, Sequence, SequenceState, StopReason};
pub use tokenizer::TokenizerLike;
pub use utils::debug::initialize_logging;
pub use utils::normal::{ModelDType, TryIntoDType};

/// `true` if `PAGEDSERVE_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
