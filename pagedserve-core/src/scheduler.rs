//! Batch types produced by the scheduler and the priority-tiered waiting queue.

use std::collections::{HashMap, VecDeque};

use crate::paged_attention::BlockId;
use crate::sequence::RequestId;

type SrcBlockFrom = BlockId;
type DstBlocksTo = Vec<BlockId>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchKind {
    /// Every sequence processes its whole uncomputed context.
    Prefill,
    /// Every sequence processes exactly its last token.
    Decode,
}

/// One row of a batch.
#[derive(Clone, Debug)]
pub struct ScheduledSequence {
    pub request_id: RequestId,
    pub input_tokens: Vec<u32>,
    /// Position of `input_tokens[0]` in the sequence.
    pub start_pos: usize,
    /// Block table after this step's allocations.
    pub block_table: Vec<BlockId>,
    /// Cache slot of every input token.
    pub slot_mapping: Vec<usize>,
}

impl ScheduledSequence {
    /// Number of positions attended to once this row's tokens are written.
    pub fn context_len(&self) -> usize {
        self.start_pos + self.input_tokens.len()
    }
}

/// Either ALL prefill or ALL decode.
#[derive(Clone, Debug)]
pub struct ScheduledBatch {
    pub kind: BatchKind,
    pub seqs: Vec<ScheduledSequence>,
    /// Copy-on-write operations to run before the forward pass.
    pub blocks_to_copy: HashMap<SrcBlockFrom, DstBlocksTo>,
}

impl ScheduledBatch {
    pub fn empty(kind: BatchKind) -> Self {
        Self {
            kind,
            seqs: Vec::new(),
            blocks_to_copy: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.seqs.iter().map(|s| s.request_id).collect()
    }

    pub fn num_tokens(&self) -> usize {
        self.seqs.iter().map(|s| s.input_tokens.len()).sum()
    }
}

pub struct SchedulerOutput {
    pub batch: ScheduledBatch,
    /// Sequences preempted while building the batch.
    pub preempted: Vec<RequestId>,
}

/// FIFO queues, one per priority tier. Iteration goes from the highest tier down.
#[derive(Debug, Clone)]
pub struct WaitingQueue {
    tiers: Vec<VecDeque<RequestId>>,
}

impl WaitingQueue {
    pub fn new(num_tiers: usize) -> Self {
        Self {
            tiers: vec![VecDeque::new(); num_tiers.max(1)],
        }
    }

    fn tier_mut(&mut self, tier: usize) -> &mut VecDeque<RequestId> {
        let top = self.tiers.len() - 1;
        &mut self.tiers[tier.min(top)]
    }

    pub fn push_back(&mut self, tier: usize, id: RequestId) {
        self.tier_mut(tier).push_back(id);
    }

    /// Re-queue ahead of everything else in the tier.
    pub fn push_front(&mut self, tier: usize, id: RequestId) {
        self.tier_mut(tier).push_front(id);
    }

    /// Highest-priority candidate.
    pub fn front(&self) -> Option<RequestId> {
        self.tiers.iter().rev().find_map(|q| q.front().copied())
    }

    pub fn pop_front(&mut self) -> Option<RequestId> {
        self.tiers.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    pub fn remove(&mut self, id: RequestId) -> bool {
        for queue in &mut self.tiers {
            if let Some(idx) = queue.iter().position(|&other| other == id) {
                queue.remove(idx);
                return true;
            }
        }
        false
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.tiers.iter().any(|q| q.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Ids in admission order.
    pub fn iter(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.tiers.iter().rev().flat_map(|q| q.iter().copied())
    }
}
