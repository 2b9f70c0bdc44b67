use candle_core::DType;

use crate::config::{EngineConfig, DEFAULT_NUM_BLOCKS};
use crate::error::{Error, Result};

const SIZE_IN_MB: usize = 1024 * 1024;

pub trait ModelConfigLike {
    fn num_layers(&self) -> usize;
    fn hidden_size(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn num_attn_heads(&self) -> usize;
    fn head_dim(&self) -> usize {
        self.hidden_size() / self.num_attn_heads()
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfigMetadata {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_kv_heads: usize,
    pub num_attn_heads: usize,
}

impl ModelConfigLike for ModelConfigMetadata {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
    fn num_attn_heads(&self) -> usize {
        self.num_attn_heads
    }
    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }
    fn num_layers(&self) -> usize {
        self.num_layers
    }
}

/// Resolved shape of the paged KV cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_gpu_blocks: usize,
    /// Bytes of one block across all layers, keys and values.
    pub block_bytes: usize,
}

impl CacheConfig {
    /// Bytes needed for one block: `2 (K and V) x layers x kv_heads x head_dim x block_size x dtype`.
    pub fn bytes_per_block(model: &dyn ModelConfigLike, block_size: usize, dtype: DType) -> usize {
        2 * model.num_layers()
            * model.num_kv_heads()
            * model.head_dim()
            * block_size
            * dtype.size_in_bytes()
    }

    /// The priority is as follows: `num_blocks` > `cache_memory_mb` > [`DEFAULT_NUM_BLOCKS`].
    pub fn resolve(config: &EngineConfig, model: &dyn ModelConfigLike, dtype: DType) -> Result<Self> {
        let block_bytes = Self::bytes_per_block(model, config.block_size, dtype);
        if block_bytes == 0 {
            return Err(Error::InvalidConfig(
                "model cache layout has a zero-sized block".into(),
            ));
        }
        let num_gpu_blocks = match (config.num_blocks, config.cache_memory_mb) {
            (Some(n), _) => n,
            (None, Some(mb)) => mb * SIZE_IN_MB / block_bytes,
            (None, None) => DEFAULT_NUM_BLOCKS,
        };
        if num_gpu_blocks == 0 {
            return Err(Error::InvalidConfig(format!(
                "a KV cache budget of {:?} MB cannot hold a single {block_bytes} byte block",
                config.cache_memory_mb
            )));
        }
        Ok(Self {
            block_size: config.block_size,
            num_gpu_blocks,
            block_bytes,
        })
    }
}
