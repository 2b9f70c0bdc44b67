/// The fixed pool of physical blocks. Operations performed by the pool do not touch the
/// memory the blocks describe.
mod block_pool;
/// The higher-level manager of the blocks: per-sequence block tables, sharing and
/// copy-on-write. It is used by the scheduler, which decides when to allocate and free.
mod cache_manager;
mod config;
mod scheduler;

pub use block_pool::{BlockId, BlockPool, BlockRegion, KVCacheBlock};
pub use cache_manager::{BlockTable, CacheManager, CacheStats, CopyOnWrite};
pub use config::{CacheConfig, ModelConfigLike, ModelConfigMetadata};
pub use scheduler::{PagedScheduler, PagedSchedulerConfig};
