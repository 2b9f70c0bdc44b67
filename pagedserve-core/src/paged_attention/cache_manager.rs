//! KV cache manager.
//!
//! The sole owner of the block pool. It maps every sequence (by request id) to its block
//! table and mediates all allocation and release. It applies no policy of its own: when
//! to allocate, free or preempt is decided by the scheduler.
//!
//! - `can_allocate`: capacity check, never mutates.
//! - `allocate`: append exactly one block to a sequence's table.
//! - `free`: release a sequence's table; a second `free` is a `DoubleFree`.
//! - `fork`: share a table with a child sequence without copying memory.
//! - `ensure_writable_tail`: copy-on-write of a shared active block.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::block_pool::{BlockId, BlockPool, BlockRegion};
use super::CacheConfig;
use crate::error::{Error, Result};
use crate::sequence::RequestId;

pub type BlockTable = Vec<BlockId>;

/// A block the executor must copy before the next forward pass: `(src, dst)`.
pub type CopyOnWrite = (BlockId, BlockId);

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub num_blocks: usize,
    pub num_free_blocks: usize,
    pub num_used_blocks: usize,
    pub usage: f64,
}

pub struct CacheManager {
    block_pool: BlockPool,
    block_size: usize,
    block_tables: HashMap<RequestId, BlockTable>,
    /// Sequences whose table was freed and not reallocated since.
    released: HashSet<RequestId>,
}

impl CacheManager {
    pub fn new(cache_config: &CacheConfig) -> Self {
        Self {
            block_pool: BlockPool::new(
                cache_config.num_gpu_blocks,
                cache_config.block_size,
                cache_config.block_bytes,
            ),
            block_size: cache_config.block_size,
            block_tables: HashMap::new(),
            released: HashSet::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.block_pool.num_gpu_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.num_free_blocks()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.block_pool.num_used_blocks()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            num_blocks: self.num_blocks(),
            num_free_blocks: self.num_free_blocks(),
            num_used_blocks: self.num_used_blocks(),
            usage: self.block_pool.usage(),
        }
    }

    /// Number of blocks needed to hold `num_tokens` tokens.
    pub fn blocks_for(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// `true` iff at least `num_blocks` blocks are free.
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        num_blocks <= self.block_pool.num_free_blocks()
    }

    /// Append one block to the sequence's block table.
    pub fn allocate(&mut self, seq_id: RequestId) -> Result<BlockId> {
        let block_id = self.block_pool.allocate().ok_or(Error::OutOfMemory)?;
        self.released.remove(&seq_id);
        self.block_tables.entry(seq_id).or_default().push(block_id);
        Ok(block_id)
    }

    /// Append `num_blocks` blocks, all or nothing.
    pub fn allocate_many(&mut self, seq_id: RequestId, num_blocks: usize) -> Result<Vec<BlockId>> {
        if !self.can_allocate(num_blocks) {
            return Err(Error::OutOfMemory);
        }
        (0..num_blocks).map(|_| self.allocate(seq_id)).collect()
    }

    /// Release every block of the sequence and clear its table.
    ///
    /// Blocks are released tail first. Returns how many physical blocks went back to the
    /// free pool (shared blocks only lose a reference).
    pub fn free(&mut self, seq_id: RequestId) -> Result<usize> {
        let Some(table) = self.block_tables.remove(&seq_id) else {
            return Err(if self.released.contains(&seq_id) {
                Error::DoubleFree(seq_id)
            } else {
                Error::invariant(format!("sequence {seq_id} has no block table to free"))
            });
        };
        let reversed: Vec<BlockId> = table.into_iter().rev().collect();
        let freed = self.block_pool.free_blocks(&reversed)?;
        self.released.insert(seq_id);
        debug!(
            "Freed {} blocks of sequence {seq_id} ({freed} returned to the pool).",
            reversed.len()
        );
        Ok(freed)
    }

    /// Drop the double-free bookkeeping of a sequence that will never allocate again.
    pub fn forget(&mut self, seq_id: RequestId) {
        self.released.remove(&seq_id);
    }

    /// Share the parent's blocks with `child` by reference counting, without copying memory.
    pub fn fork(&mut self, parent: RequestId, child: RequestId) -> Result<BlockTable> {
        if self.block_tables.contains_key(&child) {
            return Err(Error::invariant(format!(
                "fork target {child} already owns a block table"
            )));
        }
        let table = self
            .block_tables
            .get(&parent)
            .cloned()
            .ok_or_else(|| Error::invariant(format!("fork source {parent} has no block table")))?;
        self.block_pool.touch(&table)?;
        self.released.remove(&child);
        self.block_tables.insert(child, table.clone());
        Ok(table)
    }

    /// `true` if the sequence's active (last) block is shared with another table.
    pub fn tail_is_shared(&self, seq_id: RequestId) -> bool {
        self.block_tables
            .get(&seq_id)
            .and_then(|table| table.last())
            .is_some_and(|&block| self.block_pool.block_ref_cnt(block) > 1)
    }

    /// Give the sequence a private copy of its active block if that block is shared.
    ///
    /// Returns the `(src, dst)` copy the executor must perform, or `None` if the block was
    /// already private. Fails with `OutOfMemory` if a new block is needed and none is free.
    pub fn ensure_writable_tail(&mut self, seq_id: RequestId) -> Result<Option<CopyOnWrite>> {
        if !self.tail_is_shared(seq_id) {
            return Ok(None);
        }
        let new_block = self.block_pool.allocate().ok_or(Error::OutOfMemory)?;
        let table = self
            .block_tables
            .get_mut(&seq_id)
            .ok_or_else(|| Error::invariant(format!("sequence {seq_id} lost its block table")))?;
        let last = table
            .last_mut()
            .ok_or_else(|| Error::invariant(format!("sequence {seq_id} has an empty table")))?;
        let old_block = std::mem::replace(last, new_block);
        self.block_pool.free_blocks(&[old_block])?;
        Ok(Some((old_block, new_block)))
    }

    pub fn block_table(&self, seq_id: RequestId) -> Option<&[BlockId]> {
        self.block_tables.get(&seq_id).map(Vec::as_slice)
    }

    pub fn num_blocks_for_seq(&self, seq_id: RequestId) -> usize {
        self.block_tables.get(&seq_id).map_or(0, Vec::len)
    }

    pub fn has_blocks(&self, seq_id: RequestId) -> bool {
        self.block_tables.contains_key(&seq_id)
    }

    pub fn block_ref_cnt(&self, block_id: BlockId) -> u32 {
        self.block_pool.block_ref_cnt(block_id)
    }

    pub fn region(&self, block_id: BlockId) -> Result<BlockRegion> {
        self.block_pool.region(block_id)
    }

    /// Get the slot mapping for a sequence's tokens.
    ///
    /// Maps each token position to its physical slot in the KV cache:
    /// `slot = block_id * block_size + offset_within_block`
    pub fn slot_mapping(
        &self,
        seq_id: RequestId,
        start_token: usize,
        num_tokens: usize,
    ) -> Result<Vec<usize>> {
        let table = self
            .block_tables
            .get(&seq_id)
            .ok_or_else(|| Error::invariant(format!("sequence {seq_id} has no block table")))?;
        (start_token..start_token + num_tokens)
            .map(|pos| {
                table
                    .get(pos / self.block_size)
                    .map(|&block_id| block_id * self.block_size + pos % self.block_size)
                    .ok_or_else(|| {
                        Error::invariant(format!(
                            "token {pos} of sequence {seq_id} has no cache slot"
                        ))
                    })
            })
            .collect()
    }

    /// Verify that the pool is conserved and that every reference count is accounted for by
    /// exactly the block tables that hold the block.
    pub fn check_conservation(&self) -> Result<()> {
        self.block_pool.check_conservation()?;
        let mut refs: HashMap<BlockId, u32> = HashMap::new();
        for table in self.block_tables.values() {
            for &block_id in table {
                *refs.entry(block_id).or_default() += 1;
            }
        }
        if refs.len() != self.block_pool.num_used_blocks() {
            return Err(Error::invariant(format!(
                "{} blocks are referenced by tables but {} are in use",
                refs.len(),
                self.block_pool.num_used_blocks()
            )));
        }
        for (block_id, count) in refs {
            if self.block_pool.block_ref_cnt(block_id) != count {
                return Err(Error::invariant(format!(
                    "block {block_id} has ref_cnt {} but {count} table references",
                    self.block_pool.block_ref_cnt(block_id)
                )));
            }
        }
        Ok(())
    }
}
