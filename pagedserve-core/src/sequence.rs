use std::fmt::Display;

use serde::Serialize;

use crate::error::{Error, Result};

pub type RequestId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The sampler produced an end-of-sequence token.
    Eos,
    /// The sequence reached `prompt_len + max_new_tokens`.
    Length,
    /// Aborted by the caller.
    Canceled,
    /// Aborted because the model executor failed on a batch containing the sequence.
    Error,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eos => write!(f, "eos"),
            Self::Length => write!(f, "length"),
            Self::Canceled => write!(f, "canceled"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceState {
    Waiting,
    Running,
    /// Preempted: blocks released, tokens kept, waiting to be recomputed.
    Swapped,
    Finished(StopReason),
    Aborted,
}

impl SequenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Aborted)
    }

    fn can_transition_to(&self, next: &Self) -> bool {
        use SequenceState::*;
        matches!(
            (self, next),
            (Waiting, Running)
                | (Running, Finished(_))
                | (Running, Swapped)
                | (Swapped, Waiting)
                | (Waiting | Running | Swapped, Aborted)
        )
    }
}

/// Length-derived priority tier: `min(T - 1, expected_total * T / max_seq_len)`.
///
/// Longer expected sequences land in higher tiers, which are scheduled first.
pub fn priority_tier(expected_total: usize, max_seq_len: usize, num_tiers: usize) -> usize {
    let num_tiers = num_tiers.max(1);
    (expected_total * num_tiers / max_seq_len.max(1)).min(num_tiers - 1)
}

/// Generation state of one request.
#[derive(Debug, Clone)]
pub struct Sequence {
    id: RequestId,
    tokens: Vec<u32>,
    prompt_len: usize,
    max_len: usize,
    tier: usize,
    arrival: usize,
    admitted_at: usize,
    /// Tokens whose KV entries are in the cache.
    num_computed_tokens: usize,
    num_preemptions: usize,
    state: SequenceState,
}

impl Sequence {
    pub fn new_waiting(id: RequestId, prompt: Vec<u32>, max_new_tokens: usize, tier: usize) -> Self {
        let prompt_len = prompt.len();
        Self {
            id,
            tokens: prompt,
            prompt_len,
            max_len: prompt_len + max_new_tokens,
            tier,
            arrival: 0,
            admitted_at: 0,
            num_computed_tokens: 0,
            num_preemptions: 0,
            state: SequenceState::Waiting,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Current length: prompt plus generated tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get_toks(&self) -> &[u32] {
        &self.tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.tokens[..self.prompt_len]
    }

    pub fn generated_tokens(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_len - self.prompt_len
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn arrival(&self) -> usize {
        self.arrival
    }

    pub(crate) fn set_arrival(&mut self, arrival: usize) {
        self.arrival = arrival;
    }

    /// Monotonic index of the latest admission into the running set.
    pub fn admitted_at(&self) -> usize {
        self.admitted_at
    }

    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Tokens the next forward pass has to process.
    pub fn uncomputed_tokens(&self) -> &[u32] {
        &self.tokens[self.num_computed_tokens..]
    }

    pub fn is_prefilled(&self) -> bool {
        self.num_computed_tokens > 0
    }

    pub fn num_preemptions(&self) -> usize {
        self.num_preemptions
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn set_state(&mut self, state: SequenceState) -> Result<()> {
        if !self.state.can_transition_to(&state) {
            return Err(Error::invariant(format!(
                "illegal transition of sequence {} from {:?} to {state:?}",
                self.id, self.state
            )));
        }
        self.state = state;
        Ok(())
    }

    pub(crate) fn admit(&mut self, admission: usize) -> Result<()> {
        self.set_state(SequenceState::Running)?;
        self.admitted_at = admission;
        Ok(())
    }

    /// Drop the cached state. Generated tokens are kept and recomputed on re-admission.
    pub(crate) fn preempt(&mut self) -> Result<()> {
        self.set_state(SequenceState::Swapped)?;
        self.num_computed_tokens = 0;
        self.num_preemptions += 1;
        Ok(())
    }

    /// Record that the last forward pass computed every token up to the current length,
    /// then append the sampled token.
    pub(crate) fn add_token(&mut self, token: u32) -> Result<()> {
        if self.state != SequenceState::Running {
            return Err(Error::invariant(format!(
                "sequence {} received a token while {:?}",
                self.id, self.state
            )));
        }
        if self.len() >= self.max_len {
            return Err(Error::invariant(format!(
                "sequence {} would exceed its maximum length of {}",
                self.id, self.max_len
            )));
        }
        self.num_computed_tokens = self.len();
        self.tokens.push(token);
        Ok(())
    }

    /// Called after `add_token`.
    pub fn is_done(&self, is_eos: bool) -> Option<StopReason> {
        if is_eos {
            Some(StopReason::Eos)
        } else if self.len() >= self.max_len {
            Some(StopReason::Length)
        } else {
            None
        }
    }

    /// A running copy sharing every token computed so far.
    pub(crate) fn fork(&self, id: RequestId, arrival: usize, admission: usize) -> Self {
        Self {
            id,
            arrival,
            admitted_at: admission,
            num_preemptions: 0,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(prompt: Vec<u32>, max_new: usize) -> Sequence {
        let mut seq = Sequence::new_waiting(0, prompt, max_new, 0);
        seq.admit(0).unwrap();
        seq
    }

    #[test]
    fn tiers_grow_with_expected_length() {
        assert_eq!(priority_tier(10, 300, 3), 0);
        assert_eq!(priority_tier(100, 300, 3), 1);
        assert_eq!(priority_tier(250, 300, 3), 2);
        assert_eq!(priority_tier(300, 300, 3), 2);
        assert_eq!(priority_tier(300, 300, 1), 0);
    }

    #[test]
    fn legal_lifecycle() {
        let mut seq = running(vec![1, 2, 3], 4);
        seq.add_token(4).unwrap();
        assert_eq!(seq.num_computed_tokens(), 3);
        assert_eq!(seq.uncomputed_tokens(), &[4]);

        seq.preempt().unwrap();
        assert_eq!(seq.state(), SequenceState::Swapped);
        assert_eq!(seq.num_computed_tokens(), 0);
        assert_eq!(seq.generated_tokens(), &[4]);

        seq.set_state(SequenceState::Waiting).unwrap();
        seq.admit(5).unwrap();
        assert_eq!(seq.admitted_at(), 5);
        assert_eq!(seq.uncomputed_tokens(), &[1, 2, 3, 4]);
        seq.set_state(SequenceState::Finished(StopReason::Eos))
            .unwrap();
        assert!(seq.is_finished());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut seq = Sequence::new_waiting(3, vec![1], 1, 0);
        assert!(seq.set_state(SequenceState::Swapped).is_err());
        assert!(seq
            .set_state(SequenceState::Finished(StopReason::Eos))
            .is_err());
        seq.set_state(SequenceState::Aborted).unwrap();
        let err = seq.set_state(SequenceState::Waiting).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn waiting_sequence_cannot_take_tokens() {
        let mut seq = Sequence::new_waiting(0, vec![1], 2, 0);
        assert!(seq.add_token(2).is_err());
    }

    #[test]
    fn length_bound() {
        let mut seq = running(vec![1, 2], 2);
        seq.add_token(3).unwrap();
        assert_eq!(seq.is_done(false), None);
        seq.add_token(4).unwrap();
        assert_eq!(seq.is_done(false), Some(StopReason::Length));
        assert!(seq.add_token(5).is_err());
        assert_eq!(seq.len(), seq.max_len());
    }

    #[test]
    fn eos_wins_over_length() {
        let mut seq = running(vec![1], 1);
        seq.add_token(9).unwrap();
        assert_eq!(seq.is_done(true), Some(StopReason::Eos));
    }

    #[test]
    fn fork_copies_tokens() {
        let mut seq = running(vec![1, 2], 4);
        seq.add_token(3).unwrap();
        let child = seq.fork(9, 1, 1);
        assert_eq!(child.id(), 9);
        assert_eq!(child.get_toks(), seq.get_toks());
        assert_eq!(child.num_computed_tokens(), seq.num_computed_tokens());
        assert_eq!(child.state(), SequenceState::Running);
    }
}
