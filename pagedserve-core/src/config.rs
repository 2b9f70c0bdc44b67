//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::normal::ModelDType;

/// Block count used when neither `num_blocks` nor `cache_memory_mb` is given.
pub const DEFAULT_NUM_BLOCKS: usize = 512;

/// Configuration of the [`Engine`](crate::Engine).
///
/// Every field has a default, so partial JSON documents are accepted:
///
/// ```
/// use pagedserve_core::EngineConfig;
///
/// let cfg = EngineConfig::from_json_str(r#"{ "block_size": 4, "num_blocks": 2 }"#).unwrap();
/// assert_eq!(cfg.block_size, 4);
/// assert_eq!(cfg.max_batch_size, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Precision of the KV cache. Only affects the byte size of a block.
    pub dtype: ModelDType,
    /// Maximum number of sequences admitted (holding cache) at once.
    pub max_batch_size: usize,
    /// Maximum prompt length in tokens.
    pub max_input_len: usize,
    /// Maximum number of generated tokens per request.
    pub max_output_len: usize,
    /// Tokens per cache block.
    pub block_size: usize,
    /// Total number of cache blocks. Takes priority over `cache_memory_mb`.
    pub num_blocks: Option<usize>,
    /// KV cache memory budget in MB, converted to a block count with the model's cache layout.
    pub cache_memory_mb: Option<usize>,
    /// Step-level diagnostic logging. No behavioral effect.
    pub verbose: bool,
    /// A prefill step runs once `prefill / decoding >= prefill_ratio`, or when nothing decodes.
    pub prefill_ratio: f32,
    /// Number of length-derived priority tiers.
    pub num_priority_tiers: usize,
    /// Periodically log throughput and queue sizes from a background thread.
    pub throughput_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dtype: ModelDType::Auto,
            max_batch_size: 8,
            max_input_len: 1024,
            max_output_len: 256,
            block_size: 16,
            num_blocks: None,
            cache_memory_mb: None,
            verbose: false,
            prefill_ratio: 1.2,
            num_priority_tiers: 3,
            throughput_logging: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_batch_size", self.max_batch_size),
            ("max_input_len", self.max_input_len),
            ("max_output_len", self.max_output_len),
            ("block_size", self.block_size),
            ("num_priority_tiers", self.num_priority_tiers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!(
                    "`{name}` must be a strictly positive integer, got 0."
                )));
            }
        }
        if self.num_blocks == Some(0) {
            return Err(Error::InvalidConfig("`num_blocks` must not be 0.".into()));
        }
        if self.cache_memory_mb == Some(0) {
            return Err(Error::InvalidConfig(
                "`cache_memory_mb` must not be 0.".into(),
            ));
        }
        if !self.prefill_ratio.is_finite() || self.prefill_ratio <= 0. {
            return Err(Error::InvalidConfig(format!(
                "`prefill_ratio` must be a positive number, got {}.",
                self.prefill_ratio
            )));
        }
        Ok(())
    }

    /// Upper bound on the total length of any sequence.
    pub fn max_seq_len(&self) -> usize {
        self.max_input_len + self.max_output_len
    }
}
