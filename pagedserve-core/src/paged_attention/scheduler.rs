//! The scheduler uses a CacheManager to admit, batch and preempt sequences. The primary
//! method `schedule` returns the batch for one step together with the copy-on-write
//! operations the executor has to perform on the cache first.
//!
//! Sequences live in a single id-keyed arena. The waiting, running and swapped queues only
//! hold ids, and a live sequence is in exactly one of them.

use std::cmp::Reverse;
use std::collections::VecDeque;

use indexmap::IndexMap;
use tracing::{debug, warn};

use super::cache_manager::{CacheManager, CopyOnWrite};
use super::CacheConfig;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::scheduler::{BatchKind, ScheduledBatch, ScheduledSequence, SchedulerOutput, WaitingQueue};
use crate::sequence::{RequestId, Sequence, SequenceState, StopReason};

#[derive(Clone, Debug)]
pub struct PagedSchedulerConfig {
    pub max_num_seqs: usize,
    pub prefill_ratio: f32,
    pub num_priority_tiers: usize,
}

impl From<&EngineConfig> for PagedSchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_num_seqs: config.max_batch_size,
            prefill_ratio: config.prefill_ratio,
            num_priority_tiers: config.num_priority_tiers,
        }
    }
}

pub struct PagedScheduler {
    sequences: IndexMap<RequestId, Sequence>,
    waiting: WaitingQueue,
    /// Admitted, holding blocks, not yet prefilled.
    prefill: Vec<RequestId>,
    decoding: Vec<RequestId>,
    /// Preempted, in preemption order.
    swapped: VecDeque<RequestId>,
    cache_manager: CacheManager,
    pending_copies: Vec<(RequestId, CopyOnWrite)>,
    config: PagedSchedulerConfig,
    next_arrival: usize,
    next_admission: usize,
    num_preemptions: usize,
}

impl PagedScheduler {
    pub fn new(config: PagedSchedulerConfig, cache_config: &CacheConfig) -> Self {
        Self {
            sequences: IndexMap::new(),
            waiting: WaitingQueue::new(config.num_priority_tiers),
            prefill: Vec::new(),
            decoding: Vec::new(),
            swapped: VecDeque::new(),
            cache_manager: CacheManager::new(cache_config),
            pending_copies: Vec::new(),
            config,
            next_arrival: 0,
            next_admission: 0,
            num_preemptions: 0,
        }
    }

    pub fn add_sequence(&mut self, mut seq: Sequence) -> Result<()> {
        let id = seq.id();
        if self.sequences.contains_key(&id) {
            return Err(Error::invariant(format!("sequence {id} was added twice")));
        }
        if seq.state() != SequenceState::Waiting {
            return Err(Error::invariant(format!(
                "sequence {id} was added while {:?}",
                seq.state()
            )));
        }
        seq.set_arrival(self.next_arrival);
        self.next_arrival += 1;
        self.waiting.push_back(seq.tier(), id);
        self.sequences.insert(id, seq);
        Ok(())
    }

    pub fn get(&self, id: RequestId) -> Option<&Sequence> {
        self.sequences.get(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.sequences.contains_key(&id)
    }

    /// Live sequences in insertion order.
    pub fn sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.values()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_len(&self) -> usize {
        self.prefill.len() + self.decoding.len()
    }

    pub fn swapped_len(&self) -> usize {
        self.swapped.len()
    }

    pub fn has_unfinished_sequences(&self) -> bool {
        !self.sequences.is_empty()
    }

    pub fn num_preemptions(&self) -> usize {
        self.num_preemptions
    }

    pub fn cache_manager(&self) -> &CacheManager {
        &self.cache_manager
    }

    pub fn block_size(&self) -> usize {
        self.cache_manager.block_size()
    }

    pub fn schedule(&mut self) -> Result<SchedulerOutput> {
        self.readmit_swapped()?;
        self.admit_waiting()?;
        self.sort_running_by_priority_fcfs();

        let mut preempted = Vec::new();
        let kind = match self.choose_batch_kind() {
            Some(BatchKind::Decode) => {
                // Sequences forked since the last step still share their active block.
                preempted = self.reserve_decode_slots()?;
                if self.decoding.is_empty() && !self.prefill.is_empty() {
                    BatchKind::Prefill
                } else {
                    BatchKind::Decode
                }
            }
            Some(kind) => kind,
            None => {
                return Ok(SchedulerOutput {
                    batch: ScheduledBatch::empty(BatchKind::Decode),
                    preempted,
                })
            }
        };
        let batch = self.build_batch(kind)?;
        debug!(
            "Scheduled {:?} batch of {} sequences ({} tokens), {} waiting, {} swapped, {} free blocks.",
            batch.kind,
            batch.len(),
            batch.num_tokens(),
            self.waiting.len(),
            self.swapped.len(),
            self.cache_manager.num_free_blocks()
        );
        Ok(SchedulerOutput { batch, preempted })
    }

    /// Make sure every decoding sequence has a writable cache slot for its last token.
    ///
    /// A sequence that crossed a block boundary gets one new block; one whose active block
    /// is shared gets a private copy. While the pool is empty, exactly one victim is
    /// preempted per failed attempt, possibly the requesting sequence itself.
    /// Returns the preempted ids.
    pub fn reserve_decode_slots(&mut self) -> Result<Vec<RequestId>> {
        self.sort_running_by_priority_fcfs();
        let mut preempted = Vec::new();
        for id in self.decoding.clone() {
            if !self.decoding.contains(&id) || !self.needs_slot(id)? {
                continue;
            }
            while !self.cache_manager.can_allocate(1) {
                let victim = self.pick_victim().ok_or_else(|| {
                    Error::invariant(format!("no running sequence to preempt for {id}"))
                })?;
                self.preempt(victim)?;
                preempted.push(victim);
                if victim == id {
                    break;
                }
            }
            if !self.decoding.contains(&id) {
                continue;
            }
            if let Some(copy) = self.reserve_slot(id)? {
                self.pending_copies.push((id, copy));
            }
        }
        Ok(preempted)
    }

    /// Record the token sampled for `id` in the last forward pass.
    ///
    /// Returns the stop reason if the sequence is now complete; the caller then finishes it.
    pub fn append_token(
        &mut self,
        id: RequestId,
        token: u32,
        is_eos: bool,
    ) -> Result<Option<StopReason>> {
        let seq = self.seq_mut(id)?;
        seq.add_token(token)?;
        let stop = seq.is_done(is_eos);
        self.mark_prefilled(id);
        Ok(stop)
    }

    /// Move `id` from the prefill list to the decoding list. Returns `false` if it was not
    /// waiting for prefill.
    pub fn mark_prefilled(&mut self, id: RequestId) -> bool {
        let Some(pos) = self.prefill.iter().position(|&other| other == id) else {
            return false;
        };
        self.prefill.remove(pos);
        self.decoding.push(id);
        true
    }

    /// Mark a running sequence FINISHED, release its blocks and hand it back.
    pub fn finish_sequence(&mut self, id: RequestId, reason: StopReason) -> Result<Sequence> {
        self.seq_mut(id)?
            .set_state(SequenceState::Finished(reason))?;
        self.remove_running(id);
        self.cache_manager.free(id)?;
        self.release(id)
    }

    /// Remove a live sequence from whatever queue holds it, free its blocks and mark it
    /// ABORTED.
    pub fn abort_sequence(&mut self, id: RequestId) -> Result<Sequence> {
        let state = self.seq(id)?.state();
        self.seq_mut(id)?.set_state(SequenceState::Aborted)?;
        match state {
            SequenceState::Waiting => {
                self.waiting.remove(id);
            }
            SequenceState::Running => {
                self.remove_running(id);
                self.cache_manager.free(id)?;
            }
            SequenceState::Swapped => self.swapped.retain(|&other| other != id),
            SequenceState::Finished(_) | SequenceState::Aborted => unreachable!(),
        }
        self.release(id)
    }

    /// Start a new decoding sequence that shares every cache block of `parent`.
    pub fn fork_sequence(&mut self, parent: RequestId, child: RequestId) -> Result<()> {
        if !self.decoding.contains(&parent) {
            return Err(Error::InvalidRequest(format!(
                "request {parent} is not decoding and cannot be forked"
            )));
        }
        if self.running_len() >= self.config.max_num_seqs {
            return Err(Error::InvalidRequest(format!(
                "cannot fork request {parent}: {} sequences are already running",
                self.config.max_num_seqs
            )));
        }
        if self.sequences.contains_key(&child) {
            return Err(Error::invariant(format!("fork target {child} already exists")));
        }
        let forked = self
            .seq(parent)?
            .fork(child, self.next_arrival, self.next_admission);
        self.next_arrival += 1;
        self.next_admission += 1;
        self.cache_manager.fork(parent, child)?;
        self.sequences.insert(child, forked);
        self.decoding.push(child);
        debug!("Forked sequence {parent} into {child}.");
        Ok(())
    }

    /// Queue membership matches every status, running sequences hold exactly
    /// `ceil(len / block_size)` blocks and the pool is conserved.
    ///
    /// Only meaningful at a step boundary, after `reserve_decode_slots`.
    pub fn check_invariants(&self) -> Result<()> {
        self.cache_manager.check_conservation()?;
        for seq in self.sequences.values() {
            let id = seq.id();
            let memberships = [
                self.waiting.contains(id),
                self.prefill.contains(&id) || self.decoding.contains(&id),
                self.swapped.contains(&id),
            ];
            let expected = match seq.state() {
                SequenceState::Waiting => [true, false, false],
                SequenceState::Running => [false, true, false],
                SequenceState::Swapped => [false, false, true],
                state => {
                    return Err(Error::invariant(format!(
                        "terminal sequence {id} ({state:?}) is still live"
                    )))
                }
            };
            if memberships != expected {
                return Err(Error::invariant(format!(
                    "sequence {id} is {:?} but queued as {memberships:?}",
                    seq.state()
                )));
            }
            let held = self.cache_manager.num_blocks_for_seq(id);
            let required = if seq.state() == SequenceState::Running {
                self.cache_manager.blocks_for(seq.len())
            } else {
                0
            };
            if held != required {
                return Err(Error::invariant(format!(
                    "sequence {id} of length {} holds {held} blocks, expected {required}",
                    seq.len()
                )));
            }
        }
        Ok(())
    }
}

impl PagedScheduler {
    fn seq(&self, id: RequestId) -> Result<&Sequence> {
        self.sequences.get(&id).ok_or(Error::RequestNotFound(id))
    }

    fn seq_mut(&mut self, id: RequestId) -> Result<&mut Sequence> {
        self.sequences.get_mut(&id).ok_or(Error::RequestNotFound(id))
    }

    /// Move swapped sequences whose footprint fits back to the front of their tier.
    fn readmit_swapped(&mut self) -> Result<()> {
        let mut budget = self.cache_manager.num_free_blocks();
        let mut moved = Vec::new();
        while let Some(&id) = self.swapped.front() {
            let needed = self.cache_manager.blocks_for(self.seq(id)?.len());
            if needed > budget {
                break;
            }
            budget -= needed;
            self.swapped.pop_front();
            self.seq_mut(id)?.set_state(SequenceState::Waiting)?;
            moved.push(id);
        }
        for &id in moved.iter().rev() {
            let tier = self.seq(id)?.tier();
            self.waiting.push_front(tier, id);
        }
        Ok(())
    }

    fn admit_waiting(&mut self) -> Result<()> {
        // New work waits until every preempted sequence is back in the waiting queue; the
        // preempted ones already readmitted keep their place.
        let preempted_only = !self.swapped.is_empty();
        while self.running_len() < self.config.max_num_seqs {
            let head = if preempted_only {
                let sequences = &self.sequences;
                self.waiting.iter().find(|id| {
                    sequences
                        .get(id)
                        .is_some_and(|seq| seq.num_preemptions() > 0)
                })
            } else {
                self.waiting.front()
            };
            let Some(id) = head else {
                break;
            };
            let needed = self.cache_manager.blocks_for(self.seq(id)?.len());
            if !self.cache_manager.can_allocate(needed) {
                break;
            }
            self.waiting.remove(id);
            let admission = self.next_admission;
            self.next_admission += 1;
            self.seq_mut(id)?.admit(admission)?;
            self.cache_manager.allocate_many(id, needed)?;
            self.prefill.push(id);
            debug!("Admitted sequence {id} with {needed} blocks.");
        }
        Ok(())
    }

    fn choose_batch_kind(&self) -> Option<BatchKind> {
        if self.prefill.is_empty() {
            return (!self.decoding.is_empty()).then_some(BatchKind::Decode);
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.prefill.len() as f32 / self.decoding.len() as f32;
        if self.decoding.is_empty() || ratio >= self.config.prefill_ratio {
            Some(BatchKind::Prefill)
        } else {
            Some(BatchKind::Decode)
        }
    }

    fn build_batch(&mut self, kind: BatchKind) -> Result<ScheduledBatch> {
        let ids = match kind {
            BatchKind::Prefill => self.prefill.clone(),
            BatchKind::Decode => self.decoding.clone(),
        };
        let mut batch = ScheduledBatch::empty(kind);
        for id in ids {
            let seq = self.seq(id)?;
            let start_pos = seq.num_computed_tokens();
            let input_tokens = seq.uncomputed_tokens().to_vec();
            if kind == BatchKind::Decode && input_tokens.len() != 1 {
                return Err(Error::invariant(format!(
                    "decoding sequence {id} has {} uncomputed tokens",
                    input_tokens.len()
                )));
            }
            let slot_mapping =
                self.cache_manager
                    .slot_mapping(id, start_pos, input_tokens.len())?;
            let block_table = self
                .cache_manager
                .block_table(id)
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            batch.seqs.push(ScheduledSequence {
                request_id: id,
                input_tokens,
                start_pos,
                block_table,
                slot_mapping,
            });
        }
        for (_, (src, dst)) in self.pending_copies.drain(..) {
            batch.blocks_to_copy.entry(src).or_default().push(dst);
        }
        Ok(batch)
    }

    fn needs_slot(&self, id: RequestId) -> Result<bool> {
        let len = self.seq(id)?.len();
        Ok(self.cache_manager.num_blocks_for_seq(id) < self.cache_manager.blocks_for(len)
            || self.cache_manager.tail_is_shared(id))
    }

    fn reserve_slot(&mut self, id: RequestId) -> Result<Option<CopyOnWrite>> {
        let len = self.seq(id)?.len();
        if self.cache_manager.num_blocks_for_seq(id) < self.cache_manager.blocks_for(len) {
            self.cache_manager.allocate(id)?;
            Ok(None)
        } else {
            self.cache_manager.ensure_writable_tail(id)
        }
    }

    /// Lowest tier first, most recently admitted among equals.
    fn pick_victim(&self) -> Option<RequestId> {
        self.prefill
            .iter()
            .chain(&self.decoding)
            .filter_map(|id| self.sequences.get(id))
            .min_by_key(|seq| (seq.tier(), Reverse(seq.admitted_at())))
            .map(Sequence::id)
    }

    /// Preempt by dropping the cache and recomputing later.
    fn preempt(&mut self, id: RequestId) -> Result<()> {
        self.seq_mut(id)?.preempt()?;
        self.remove_running(id);
        let freed = self.cache_manager.free(id)?;
        self.swapped.push_back(id);
        self.num_preemptions += 1;
        let seq = self.seq(id)?;
        warn!(
            "Preempted sequence {id} (tier {}, {} tokens), reclaiming {freed} blocks.",
            seq.tier(),
            seq.len()
        );
        Ok(())
    }

    fn remove_running(&mut self, id: RequestId) {
        self.prefill.retain(|&other| other != id);
        self.decoding.retain(|&other| other != id);
        self.pending_copies.retain(|&(owner, _)| owner != id);
    }

    /// Drop a terminal sequence from the arena.
    fn release(&mut self, id: RequestId) -> Result<Sequence> {
        self.cache_manager.forget(id);
        self.sequences.shift_remove(&id).ok_or(Error::RequestNotFound(id))
    }

    /// Highest tier first, then arrival order.
    fn sort_running_by_priority_fcfs(&mut self) {
        let sequences = &self.sequences;
        let key = |id: &RequestId| sequences.get(id).map(|s| (Reverse(s.tier()), s.arrival()));
        self.prefill.sort_by_key(key);
        self.decoding.sort_by_key(key);
    }
}
