//! Block pool for the paged KV cache.
//!
//! A flat `Vec` of blocks indexed by block id plus a FIFO free list:
//! - O(1) allocation (pop from the free list head, least recently freed first)
//! - O(1) free (append to the free list tail once the reference count drops to zero)
//! - reference counts allow several block tables to share a physical block

use std::collections::VecDeque;

use crate::error::{Error, Result};

pub type BlockId = usize;

/// Location of a block inside the backing KV cache allocation.
///
/// The pool never touches this memory; the region is handed to the model executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRegion {
    pub offset_bytes: usize,
    pub len_bytes: usize,
}

/// Metadata for a single KV cache block.
#[derive(Debug)]
pub struct KVCacheBlock {
    /// Block ID, ranging from 0 to num_gpu_blocks - 1.
    pub block_id: BlockId,
    /// Reference count. 0 means the block is in the free list.
    pub ref_cnt: u32,
    pub region: BlockRegion,
}

/// The block pool owns every physical KV cache block.
pub struct BlockPool {
    blocks: Vec<KVCacheBlock>,
    free_queue: VecDeque<BlockId>,
    block_size: usize,
}

impl BlockPool {
    /// Create a pool of `num_gpu_blocks` blocks of `block_size` tokens,
    /// each occupying `block_bytes` of cache memory.
    pub fn new(num_gpu_blocks: usize, block_size: usize, block_bytes: usize) -> Self {
        assert!(num_gpu_blocks > 0, "Must have at least 1 GPU block");
        let blocks = (0..num_gpu_blocks)
            .map(|block_id| KVCacheBlock {
                block_id,
                ref_cnt: 0,
                region: BlockRegion {
                    offset_bytes: block_id * block_bytes,
                    len_bytes: block_bytes,
                },
            })
            .collect();
        Self {
            blocks,
            free_queue: (0..num_gpu_blocks).collect(),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_gpu_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of free blocks available for allocation.
    pub fn num_free_blocks(&self) -> usize {
        self.free_queue.len()
    }

    /// Number of distinct physical blocks referenced by at least one block table.
    pub fn num_used_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.ref_cnt > 0).count()
    }

    /// Get KV cache usage as a fraction [0.0, 1.0].
    #[allow(clippy::cast_precision_loss)]
    pub fn usage(&self) -> f64 {
        1.0 - (self.num_free_blocks() as f64 / self.num_gpu_blocks() as f64)
    }

    /// Pop one block from the free list with `ref_cnt == 1`, or `None` when exhausted.
    pub fn allocate(&mut self) -> Option<BlockId> {
        let block_id = self.free_queue.pop_front()?;
        debug_assert_eq!(self.blocks[block_id].ref_cnt, 0);
        self.blocks[block_id].ref_cnt = 1;
        Some(block_id)
    }

    /// Allocate `num_blocks` blocks, all or nothing.
    pub fn get_new_blocks(&mut self, num_blocks: usize) -> Option<Vec<BlockId>> {
        if num_blocks > self.num_free_blocks() {
            return None;
        }
        (0..num_blocks).map(|_| self.allocate()).collect()
    }

    /// Add one reference to blocks that are already in use (block sharing).
    pub fn touch(&mut self, block_ids: &[BlockId]) -> Result<()> {
        for &block_id in block_ids {
            let block = self.block(block_id)?;
            if block.ref_cnt == 0 {
                return Err(Error::invariant(format!(
                    "block {block_id} is free and cannot gain a reference"
                )));
            }
        }
        for &block_id in block_ids {
            self.blocks[block_id].ref_cnt += 1;
        }
        Ok(())
    }

    /// Drop one reference from each block; blocks reaching zero return to the free list tail.
    ///
    /// Returns how many blocks went back to the free list.
    pub fn free_blocks(&mut self, ordered_block_ids: &[BlockId]) -> Result<usize> {
        for &block_id in ordered_block_ids {
            if self.block(block_id)?.ref_cnt == 0 {
                return Err(Error::invariant(format!(
                    "block {block_id} experienced a double free"
                )));
            }
        }
        let mut freed = 0;
        for &block_id in ordered_block_ids {
            let block = &mut self.blocks[block_id];
            block.ref_cnt -= 1;
            if block.ref_cnt == 0 {
                self.free_queue.push_back(block_id);
                freed += 1;
            }
        }
        Ok(freed)
    }

    pub fn block_ref_cnt(&self, block_id: BlockId) -> u32 {
        self.blocks[block_id].ref_cnt
    }

    pub fn region(&self, block_id: BlockId) -> Result<BlockRegion> {
        Ok(self.block(block_id)?.region)
    }

    /// `free + in use == total`, and the free list holds exactly the zero-refcount blocks.
    pub fn check_conservation(&self) -> Result<()> {
        let used = self.num_used_blocks();
        if self.num_free_blocks() + used != self.num_gpu_blocks() {
            return Err(Error::invariant(format!(
                "pool leak: {} free + {used} used != {} total",
                self.num_free_blocks(),
                self.num_gpu_blocks()
            )));
        }
        if let Some(id) = self.free_queue.iter().find(|&&id| self.blocks[id].ref_cnt != 0) {
            return Err(Error::invariant(format!(
                "block {id} is in the free list while referenced"
            )));
        }
        Ok(())
    }

    fn block(&self, block_id: BlockId) -> Result<&KVCacheBlock> {
        self.blocks
            .get(block_id)
            .ok_or_else(|| Error::invariant(format!("block {block_id} does not exist")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocation() {
        let mut pool = BlockPool::new(4, 16, 128);
        assert_eq!(pool.num_free_blocks(), 4);

        let blocks = pool.get_new_blocks(2).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(pool.num_free_blocks(), 2);
        assert_eq!(pool.num_used_blocks(), 2);

        for &id in &blocks {
            assert_eq!(pool.block_ref_cnt(id), 1);
        }
        pool.check_conservation().unwrap();
    }

    #[test]
    fn test_free_returns_to_pool() {
        let mut pool = BlockPool::new(3, 16, 128);
        let blocks = pool.get_new_blocks(3).unwrap();
        assert_eq!(pool.num_free_blocks(), 0);

        assert_eq!(pool.free_blocks(&blocks).unwrap(), 3);
        assert_eq!(pool.num_free_blocks(), 3);
        for &id in &blocks {
            assert_eq!(pool.block_ref_cnt(id), 0);
        }
    }

    #[test]
    fn test_allocation_fails_when_exhausted() {
        let mut pool = BlockPool::new(1, 16, 128);
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert!(pool.get_new_blocks(1).is_none());
    }

    #[test]
    fn test_get_new_blocks_is_all_or_nothing() {
        let mut pool = BlockPool::new(3, 16, 128);
        pool.allocate().unwrap();
        assert!(pool.get_new_blocks(3).is_none());
        assert_eq!(pool.num_free_blocks(), 2);
    }

    #[test]
    fn test_touch_ref_cnt_management() {
        let mut pool = BlockPool::new(8, 4, 64);
        let block_ids = pool.get_new_blocks(1).unwrap();

        pool.touch(&block_ids).unwrap();
        assert_eq!(pool.block_ref_cnt(block_ids[0]), 2);

        // Free once, still shared
        assert_eq!(pool.free_blocks(&block_ids).unwrap(), 0);
        assert_eq!(pool.block_ref_cnt(block_ids[0]), 1);
        assert_eq!(pool.num_used_blocks(), 1);

        // Free again, back in the free list
        assert_eq!(pool.free_blocks(&block_ids).unwrap(), 1);
        assert_eq!(pool.num_free_blocks(), 8);
        pool.check_conservation().unwrap();
    }

    #[test]
    fn test_touch_free_block_is_rejected() {
        let mut pool = BlockPool::new(2, 4, 64);
        assert!(pool.touch(&[0]).is_err());
    }

    #[test]
    fn test_double_free_is_rejected() {
        let mut pool = BlockPool::new(2, 4, 64);
        let ids = pool.get_new_blocks(1).unwrap();
        pool.free_blocks(&ids).unwrap();
        let err = pool.free_blocks(&ids).unwrap_err();
        assert!(matches!(err, Error::AllocatorInvariantViolation(_)));
        pool.check_conservation().unwrap();
    }

    #[test]
    fn test_regions_are_disjoint() {
        let pool = BlockPool::new(3, 4, 256);
        assert_eq!(
            pool.region(2).unwrap(),
            BlockRegion {
                offset_bytes: 512,
                len_bytes: 256
            }
        );
        assert!(pool.region(3).is_err());
    }

    #[test]
    fn test_usage() {
        let mut pool = BlockPool::new(4, 16, 1);
        assert!(pool.usage() < 0.01);
        let _b = pool.get_new_blocks(4).unwrap();
        assert!((pool.usage() - 1.0).abs() < 0.01);
    }
}
