use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::paged_attention::CacheConfig;
use crate::sequence::{priority_tier, RequestId, Sequence};
use crate::tokenizer::TokenizerLike;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Tokens(Vec<u32>),
}

/// A generation request as submitted by a caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInput {
    pub prompt: Prompt,
    /// Defaults to, and is capped by, `max_output_len`.
    pub max_new_tokens: Option<usize>,
}

impl RequestInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            prompt: Prompt::Text(text.into()),
            max_new_tokens: None,
        }
    }

    pub fn tokens(tokens: Vec<u32>) -> Self {
        Self {
            prompt: Prompt::Tokens(tokens),
            max_new_tokens: None,
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }
}

impl From<&str> for RequestInput {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for RequestInput {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<Vec<u32>> for RequestInput {
    fn from(tokens: Vec<u32>) -> Self {
        Self::tokens(tokens)
    }
}

pub(crate) enum Request {
    Add(Sequence),
    Abort(RequestId),
}

/// Turns request inputs into WAITING sequences, rejecting the ones that can never complete.
pub(crate) struct RequestValidator {
    tokenizer: Arc<dyn TokenizerLike>,
    max_input_len: usize,
    max_output_len: usize,
    max_seq_len: usize,
    num_priority_tiers: usize,
    block_size: usize,
    num_blocks: usize,
}

impl RequestValidator {
    pub(crate) fn new(
        config: &EngineConfig,
        cache_config: &CacheConfig,
        tokenizer: Arc<dyn TokenizerLike>,
    ) -> Self {
        Self {
            tokenizer,
            max_input_len: config.max_input_len,
            max_output_len: config.max_output_len,
            max_seq_len: config.max_seq_len(),
            num_priority_tiers: config.num_priority_tiers,
            block_size: cache_config.block_size,
            num_blocks: cache_config.num_gpu_blocks,
        }
    }

    pub(crate) fn build_sequence(&self, id: RequestId, input: RequestInput) -> Result<Sequence> {
        let prompt = match input.prompt {
            Prompt::Text(text) => self.tokenizer.encode(&text)?,
            Prompt::Tokens(tokens) => tokens,
        };
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("Prompt is empty.".into()));
        }
        if prompt.len() > self.max_input_len {
            return Err(Error::InvalidRequest(format!(
                "Prompt sequence length {} is greater than `max_input_len` {}.",
                prompt.len(),
                self.max_input_len
            )));
        }
        let max_new_tokens = match input.max_new_tokens {
            Some(0) => {
                return Err(Error::InvalidRequest(
                    "`max_new_tokens` must be at least 1.".into(),
                ))
            }
            Some(n) => n.min(self.max_output_len),
            None => self.max_output_len,
        };
        // The last sampled token is never written to the cache.
        let required_blocks = (prompt.len() + max_new_tokens - 1).div_ceil(self.block_size);
        if required_blocks > self.num_blocks {
            return Err(Error::CapacityExceeded {
                required_blocks,
                num_blocks: self.num_blocks,
            });
        }
        let tier = priority_tier(
            prompt.len() + max_new_tokens,
            self.max_seq_len,
            self.num_priority_tiers,
        );
        Ok(Sequence::new_waiting(id, prompt, max_new_tokens, tier))
    }
}

/// Cloneable front-end to an [`Engine`](super::Engine), usable from any thread.
///
/// Requests are validated immediately and picked up by the engine at the start of its next
/// step, in submission order.
#[derive(Clone)]
pub struct EngineHandle {
    tx: UnboundedSender<Request>,
    validator: Arc<RequestValidator>,
    next_id: Arc<AtomicUsize>,
    /// Requests sent but not yet drained by the engine.
    pending: Arc<AtomicUsize>,
}

impl EngineHandle {
    pub(crate) fn new(tx: UnboundedSender<Request>, validator: RequestValidator) -> Self {
        Self {
            tx,
            validator: Arc::new(validator),
            next_id: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn add_request(&self, input: impl Into<RequestInput>) -> Result<RequestId> {
        let id = self.next_id();
        let seq = self
            .validator
            .build_sequence(id, input.into())
            .inspect_err(|e| warn!("Rejected request {id}: {e}"))?;
        self.send(Request::Add(seq))?;
        Ok(id)
    }

    /// Abort a request at the start of the engine's next step.
    pub fn abort(&self, id: RequestId) -> Result<()> {
        self.send(Request::Abort(id))
    }

    pub(crate) fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn num_pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn mark_received(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    fn send(&self, request: Request) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(request).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            Error::Disconnected
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ToyTokenizer;

    fn validator(num_blocks: usize) -> RequestValidator {
        let config = EngineConfig {
            max_input_len: 8,
            max_output_len: 8,
            block_size: 4,
            ..Default::default()
        };
        let cache_config = CacheConfig {
            block_size: 4,
            num_gpu_blocks: num_blocks,
            block_bytes: 64,
        };
        RequestValidator::new(&config, &cache_config, Arc::new(ToyTokenizer))
    }

    #[test]
    fn rejects_malformed_requests() {
        let v = validator(16);
        for input in [
            RequestInput::tokens(vec![]),
            RequestInput::text(""),
            RequestInput::tokens(vec![1; 9]),
            RequestInput::tokens(vec![1]).with_max_new_tokens(0),
        ] {
            assert!(matches!(
                v.build_sequence(0, input),
                Err(Error::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn rejects_requests_that_can_never_fit() {
        // ceil((4 + 8 - 1) / 4) = 3 blocks
        let err = validator(2)
            .build_sequence(0, RequestInput::tokens(vec![1; 4]))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                required_blocks: 3,
                num_blocks: 2
            }
        ));
        validator(2)
            .build_sequence(0, RequestInput::tokens(vec![1; 4]).with_max_new_tokens(4))
            .unwrap();
    }

    #[test]
    fn caps_max_new_tokens() {
        let v = validator(16);
        let seq = v
            .build_sequence(3, RequestInput::text("abc").with_max_new_tokens(100))
            .unwrap();
        assert_eq!(seq.id(), 3);
        assert_eq!(seq.get_toks(), &[1, 2, 3]);
        assert_eq!(seq.max_new_tokens(), 8);
        assert_eq!(v.build_sequence(4, "ab".into()).unwrap().max_new_tokens(), 8);
    }

    #[test]
    fn handle_reports_disconnection() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = EngineHandle::new(tx, validator(16));
        assert_eq!(handle.add_request(vec![1, 2]).unwrap(), 0);
        assert_eq!(handle.num_pending(), 1);
        drop(rx);
        assert!(matches!(handle.abort(0), Err(Error::Disconnected)));
        assert_eq!(handle.num_pending(), 1);
    }
}
