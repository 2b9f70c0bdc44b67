//! Deterministic doubles for the model, the tokenizer and a ready-made engine.

use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};

use crate::{
    config::EngineConfig,
    engine::Engine,
    error::Result,
    executor::{GreedySampler, ModelExecutor},
    paged_attention::{ModelConfigLike, ModelConfigMetadata},
    scheduler::{BatchKind, ScheduledBatch},
    sequence::RequestId,
    tokenizer::TokenizerLike,
};

pub(crate) const VOCAB: usize = 64;
pub(crate) const EOS: u32 = 63;

pub(crate) type BatchLog = Arc<Mutex<Vec<(BatchKind, Vec<RequestId>)>>>;

/// Predicts `last input token + 1` for every row.
pub(crate) struct MockExecutor {
    device: Device,
    model: ModelConfigMetadata,
    log: BatchLog,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl MockExecutor {
    pub(crate) fn new() -> (Self, BatchLog) {
        let log = BatchLog::default();
        let executor = Self {
            device: Device::Cpu,
            model: ModelConfigMetadata {
                num_layers: 2,
                hidden_size: 64,
                num_kv_heads: 2,
                num_attn_heads: 4,
            },
            log: log.clone(),
            calls: 0,
            fail_on_call: None,
        };
        (executor, log)
    }

    /// Fail the forward call with this zero-based index.
    pub(crate) fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }
}

impl ModelExecutor for MockExecutor {
    fn device(&self) -> &Device {
        &self.device
    }

    fn model_config(&self) -> &dyn ModelConfigLike {
        &self.model
    }

    fn forward(&mut self, batch: &ScheduledBatch) -> anyhow::Result<Tensor> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            anyhow::bail!("injected failure on forward call {call}");
        }
        self.log
            .lock()
            .unwrap()
            .push((batch.kind, batch.request_ids()));

        let mut logits = vec![0f32; batch.len() * VOCAB];
        for (row, seq) in batch.seqs.iter().enumerate() {
            let last = *seq.input_tokens.last().unwrap() as usize;
            logits[row * VOCAB + (last + 1) % VOCAB] = 1.;
        }
        Ok(Tensor::from_vec(logits, (batch.len(), VOCAB), &self.device)?)
    }
}

/// `a..z` map to `1..=26`.
pub(crate) struct ToyTokenizer;

impl TokenizerLike for ToyTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .bytes()
            .filter(u8::is_ascii_lowercase)
            .map(|b| u32::from(b - b'a') + 1)
            .collect())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|&id| match id {
                1..=26 => char::from(b'a' + (id - 1) as u8),
                _ => '?',
            })
            .collect())
    }
}

pub(crate) fn mock_engine(config: EngineConfig) -> (Engine, BatchLog) {
    let (executor, log) = MockExecutor::new();
    let engine = Engine::new(
        Box::new(executor),
        Box::new(GreedySampler::new([EOS])),
        Arc::new(ToyTokenizer),
        config,
    )
    .unwrap();
    (engine, log)
}
