use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::{
    config::EngineConfig,
    error::{Error, Result},
    executor::{ModelExecutor, SampledToken, Sampler},
    paged_attention::{CacheConfig, CacheStats, PagedScheduler},
    response::{GenerationOutput, StepOutput},
    scheduler::{ScheduledBatch, SchedulerOutput},
    sequence::{RequestId, Sequence, StopReason},
    tokenizer::TokenizerLike,
    utils::normal::TryIntoDType,
    DEBUG,
};

mod logger;
mod request;

pub use logger::IntervalLogger;
pub use request::{EngineHandle, Prompt, RequestInput};
use request::{Request, RequestValidator};

const LOGGER_INTERVAL: Duration = Duration::from_secs(5);

/// `info!` when verbose, `debug!` otherwise.
macro_rules! step_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

struct FinishedRequest {
    seq: Sequence,
    reason: StopReason,
}

/// Drives the step loop: intake, scheduling, the forward pass, sampling and cache reclamation.
///
/// The engine owns the scheduler and, through it, the only KV cache pool. Everything runs on
/// the caller's thread; other threads submit work through an [`EngineHandle`].
pub struct Engine {
    executor: Box<dyn ModelExecutor>,
    sampler: Box<dyn Sampler>,
    tokenizer: Arc<dyn TokenizerLike>,
    scheduler: PagedScheduler,
    config: EngineConfig,
    cache_config: CacheConfig,
    rx: UnboundedReceiver<Request>,
    handle: EngineHandle,
    finished: HashMap<RequestId, FinishedRequest>,
    /// Aborts applied from the intake, reported by the next step.
    pending_aborted: Vec<RequestId>,
    /// Preemptions of a step whose forward pass failed, reported by the next step.
    pending_preempted: Vec<RequestId>,
    logger: IntervalLogger,
    num_steps: usize,
    verbose: bool,
}

impl Engine {
    #[allow(clippy::cast_precision_loss)]
    pub fn new(
        executor: Box<dyn ModelExecutor>,
        sampler: Box<dyn Sampler>,
        tokenizer: Arc<dyn TokenizerLike>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dtype = config.dtype.try_into_dtype(executor.device())?;
        let cache_config = CacheConfig::resolve(&config, executor.model_config(), dtype)?;
        info!(
            "Allocating {} KV cache blocks of {} tokens, {:.2} MB total.",
            cache_config.num_gpu_blocks,
            cache_config.block_size,
            (cache_config.num_gpu_blocks * cache_config.block_bytes) as f64 / (1024. * 1024.)
        );
        let scheduler = PagedScheduler::new((&config).into(), &cache_config);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = EngineHandle::new(
            tx,
            RequestValidator::new(&config, &cache_config, tokenizer.clone()),
        );
        let logger = IntervalLogger::new(LOGGER_INTERVAL);
        if config.throughput_logging {
            logger.enable_logging();
        }
        let verbose = config.verbose || DEBUG.load(std::sync::atomic::Ordering::Relaxed);
        Ok(Self {
            executor,
            sampler,
            tokenizer,
            scheduler,
            config,
            cache_config,
            rx,
            handle,
            finished: HashMap::new(),
            pending_aborted: Vec::new(),
            pending_preempted: Vec::new(),
            logger,
            num_steps: 0,
            verbose,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Validate a request and queue it. It is admitted at the start of the next step.
    pub fn add_request(&mut self, input: impl Into<RequestInput>) -> Result<RequestId> {
        self.handle.add_request(input)
    }

    /// Abort a request right away, releasing its blocks. Its output is kept with
    /// [`StopReason::Canceled`].
    pub fn abort_request(&mut self, id: RequestId) -> Result<()> {
        self.drain_requests()?;
        let seq = self.scheduler.abort_sequence(id)?;
        info!("Aborted request {id}.");
        self.record_finished(seq, StopReason::Canceled);
        Ok(())
    }

    /// Start a new request continuing from a decoding request, sharing its cache blocks.
    pub fn fork_request(&mut self, parent: RequestId) -> Result<RequestId> {
        let child = self.handle.next_id();
        self.scheduler.fork_sequence(parent, child)?;
        self.logger.add_new_sequence();
        step_log!(self.verbose, "Forked request {parent} into {child}.");
        Ok(child)
    }

    pub fn step(&mut self) -> Result<StepOutput> {
        self.drain_requests()?;
        let mut output = StepOutput {
            aborted: std::mem::take(&mut self.pending_aborted),
            preempted: std::mem::take(&mut self.pending_preempted),
            ..Default::default()
        };
        let SchedulerOutput { batch, preempted } = self.scheduler.schedule()?;
        output.preempted.extend(preempted);
        if batch.is_empty() {
            self.update_logger();
            return Ok(output);
        }
        self.num_steps += 1;

        let sampled = match self.run_batch(&batch) {
            Ok(sampled) => sampled,
            Err(source) => {
                self.pending_aborted = output.aborted;
                self.pending_preempted = output.preempted;
                return Err(self.fail_batch(&batch, source));
            }
        };
        for (row, SampledToken { token, is_eos }) in batch.seqs.iter().zip(sampled) {
            let id = row.request_id;
            output.new_tokens.push((id, token));
            if let Some(reason) = self.scheduler.append_token(id, token, is_eos)? {
                let seq = self.scheduler.finish_sequence(id, reason)?;
                step_log!(
                    self.verbose,
                    "Request {id} finished ({reason}) with {} generated tokens.",
                    seq.generated_tokens().len()
                );
                self.record_finished(seq, reason);
                output.finished.push(id);
            }
        }
        output
            .preempted
            .extend(self.scheduler.reserve_decode_slots()?);

        self.logger.add_tokens_processed(batch.num_tokens());
        self.logger.add_preemptions(output.preempted.len());
        self.update_logger();
        step_log!(
            self.verbose,
            "Step {}: {:?} batch of {} sequences, {} finished, {} preempted, {} free blocks.",
            self.num_steps,
            batch.kind,
            batch.len(),
            output.finished.len(),
            output.preempted.len(),
            self.scheduler.cache_manager().num_free_blocks()
        );
        Ok(output)
    }

    /// Submit every input, step until all of them are done and return their outputs in
    /// input order.
    pub fn generate<I>(&mut self, inputs: impl IntoIterator<Item = I>) -> Result<Vec<GenerationOutput>>
    where
        I: Into<RequestInput>,
    {
        let mut ids = Vec::new();
        for input in inputs {
            match self.add_request(input) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for &id in &ids {
                        self.handle.abort(id)?;
                    }
                    self.drain_requests()?;
                    self.pending_aborted.retain(|id| !ids.contains(id));
                    for id in ids {
                        self.finished.remove(&id);
                    }
                    return Err(e);
                }
            }
        }
        while ids.iter().any(|id| !self.finished.contains_key(id)) {
            let queued = (self.num_waiting(), self.num_swapped());
            let output = self.step()?;
            if output.is_empty()
                && self.num_running() == 0
                && (self.num_waiting(), self.num_swapped()) == queued
            {
                return Err(Error::invariant(
                    "scheduler made no progress with requests outstanding",
                ));
            }
        }
        ids.into_iter()
            .map(|id| {
                self.take_output(id)
                    .and_then(|output| output.ok_or(Error::RequestNotFound(id)))
            })
            .collect()
    }

    /// Remove and return the output of a finished or aborted request.
    pub fn take_output(&mut self, id: RequestId) -> Result<Option<GenerationOutput>> {
        let Some(FinishedRequest { seq, reason }) = self.finished.remove(&id) else {
            return Ok(None);
        };
        let text = self.tokenizer.decode(seq.generated_tokens())?;
        Ok(Some(GenerationOutput {
            request_id: id,
            prompt_tokens: seq.prompt_tokens().to_vec(),
            token_ids: seq.generated_tokens().to_vec(),
            text,
            finish_reason: reason,
            num_preemptions: seq.num_preemptions(),
        }))
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.scheduler.has_unfinished_sequences() || self.handle.num_pending() > 0
    }

    pub fn num_waiting(&self) -> usize {
        self.scheduler.waiting_len()
    }

    pub fn num_running(&self) -> usize {
        self.scheduler.running_len()
    }

    pub fn num_swapped(&self) -> usize {
        self.scheduler.swapped_len()
    }

    pub fn num_preemptions(&self) -> usize {
        self.scheduler.num_preemptions()
    }

    /// Number of steps that ran a forward pass.
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.scheduler.cache_manager().stats()
    }

    fn drain_requests(&mut self) -> Result<()> {
        while let Ok(request) = self.rx.try_recv() {
            self.handle.mark_received();
            match request {
                Request::Add(seq) => {
                    step_log!(
                        self.verbose,
                        "Queued request {} with {} prompt tokens in tier {}.",
                        seq.id(),
                        seq.prompt_len(),
                        seq.tier()
                    );
                    self.logger.add_new_sequence();
                    self.scheduler.add_sequence(seq)?;
                }
                Request::Abort(id) => match self.scheduler.abort_sequence(id) {
                    Ok(seq) => {
                        info!("Aborted request {id}.");
                        self.record_finished(seq, StopReason::Canceled);
                        self.pending_aborted.push(id);
                    }
                    Err(Error::RequestNotFound(_)) => {
                        warn!("Cannot abort request {id}: it is not in flight.");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(())
    }

    fn run_batch(&mut self, batch: &ScheduledBatch) -> anyhow::Result<Vec<SampledToken>> {
        let logits = self.executor.forward(batch)?;
        let rows = logits.dim(0)?;
        if rows != batch.len() {
            anyhow::bail!(
                "executor returned {rows} rows of logits for a batch of {} sequences",
                batch.len()
            );
        }
        // Every row is sampled before any token is applied.
        (0..rows)
            .map(|i| self.sampler.sample(&logits.get(i)?))
            .collect()
    }

    /// Abort every sequence of a failed batch and build the error for the caller.
    fn fail_batch(&mut self, batch: &ScheduledBatch, source: anyhow::Error) -> Error {
        let request_ids = batch.request_ids();
        error!("Model executor failed, aborting requests {request_ids:?}: {source}");
        for &id in &request_ids {
            match self.scheduler.abort_sequence(id) {
                Ok(seq) => self.record_finished(seq, StopReason::Error),
                Err(e) => return e,
            }
        }
        Error::ExecutorFailure {
            request_ids,
            source,
        }
    }

    fn record_finished(&mut self, seq: Sequence, reason: StopReason) {
        self.finished
            .insert(seq.id(), FinishedRequest { seq, reason });
    }

    fn update_logger(&self) {
        self.logger.set_num_running(self.scheduler.running_len());
        self.logger
            .set_num_waiting(self.scheduler.waiting_len() + self.scheduler.swapped_len());
        self.logger
            .set_cache_usage(self.scheduler.cache_manager().stats().usage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::GreedySampler;
    use crate::scheduler::BatchKind;
    use crate::testing::{mock_engine, MockExecutor, ToyTokenizer, EOS};

    fn scenario_config() -> EngineConfig {
        EngineConfig {
            block_size: 4,
            num_blocks: Some(2),
            max_input_len: 4,
            max_output_len: 2,
            ..Default::default()
        }
    }

    #[test]
    fn generates_text_in_input_order() {
        let (mut engine, _) = mock_engine(EngineConfig::default());
        let outputs = engine
            .generate([
                RequestInput::text("abc").with_max_new_tokens(2),
                RequestInput::text("hello").with_max_new_tokens(3),
            ])
            .unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].text, "de");
        assert_eq!(outputs[0].finish_reason, StopReason::Length);
        assert_eq!(outputs[1].text, "pqr");
        assert_eq!(outputs[1].prompt_tokens.len(), 5);
        assert!(!engine.has_unfinished_requests());
        assert_eq!(engine.cache_stats().num_used_blocks, 0);
    }

    #[test]
    fn two_sequences_share_two_blocks() {
        let (mut engine, log) = mock_engine(scenario_config());
        let a = engine.add_request(vec![1, 2, 3, 4]).unwrap();
        let b = engine.add_request(vec![10, 11, 12, 13]).unwrap();

        let mut finished = Vec::new();
        let mut preempted = Vec::new();
        while engine.has_unfinished_requests() {
            let output = engine.step().unwrap();
            assert!(engine.cache_stats().num_used_blocks <= 2);
            engine.scheduler.check_invariants().unwrap();
            finished.extend(output.finished);
            preempted.extend(output.preempted);
        }
        assert_eq!(finished, vec![a, b]);
        assert_eq!(preempted, vec![b]);

        let out_a = engine.take_output(a).unwrap().unwrap();
        let out_b = engine.take_output(b).unwrap().unwrap();
        assert_eq!(out_a.token_ids, vec![5, 6]);
        assert_eq!(out_b.token_ids, vec![14, 15]);
        assert_eq!(out_b.num_preemptions, 1);
        assert_eq!(out_b.finish_reason, StopReason::Length);

        let batches = log.lock().unwrap().clone();
        assert_eq!(
            batches,
            vec![
                (BatchKind::Prefill, vec![a, b]),
                (BatchKind::Decode, vec![a]),
                (BatchKind::Prefill, vec![b]),
            ]
        );
        assert_eq!(engine.cache_stats().num_free_blocks, 2);
    }

    #[test]
    fn stops_on_eos() {
        let (mut engine, _) = mock_engine(EngineConfig::default());
        let outputs = engine
            .generate([RequestInput::tokens(vec![EOS - 3, EOS - 2]).with_max_new_tokens(10)])
            .unwrap();
        assert_eq!(outputs[0].token_ids, vec![EOS - 1, EOS]);
        assert_eq!(outputs[0].finish_reason, StopReason::Eos);
    }

    #[test]
    fn never_exceeds_max_length() {
        let (mut engine, _) = mock_engine(EngineConfig {
            max_output_len: 3,
            ..Default::default()
        });
        let id = engine.add_request(vec![1, 2]).unwrap();
        let mut produced = 0;
        while engine.has_unfinished_requests() {
            produced += engine
                .step()
                .unwrap()
                .new_tokens
                .iter()
                .filter(|(other, _)| *other == id)
                .count();
        }
        assert_eq!(produced, 3);
        assert_eq!(engine.take_output(id).unwrap().unwrap().token_ids.len(), 3);
    }

    #[test]
    fn rejects_invalid_requests() {
        let (mut engine, _) = mock_engine(scenario_config());
        assert!(matches!(
            engine.add_request(Vec::<u32>::new()),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            engine.add_request(vec![1; 5]),
            Err(Error::InvalidRequest(_))
        ));
        assert!(!engine.has_unfinished_requests());

        let (mut engine, _) = mock_engine(EngineConfig {
            max_output_len: 8,
            ..scenario_config()
        });
        assert!(matches!(
            engine.add_request(vec![1; 4]),
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn generate_rejects_the_whole_batch() {
        let (mut engine, _) = mock_engine(scenario_config());
        let err = engine
            .generate([vec![1, 2], vec![1; 9]])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!engine.has_unfinished_requests());
        assert!(engine.step().unwrap().new_tokens.is_empty());
    }

    #[test]
    fn abort_waiting_and_running() {
        let (mut engine, _) = mock_engine(EngineConfig {
            max_batch_size: 1,
            ..Default::default()
        });
        let running = engine
            .add_request(RequestInput::tokens(vec![1, 2, 3]).with_max_new_tokens(8))
            .unwrap();
        let waiting = engine
            .add_request(RequestInput::tokens(vec![4, 5, 6]).with_max_new_tokens(8))
            .unwrap();
        let output = engine.step().unwrap();
        assert_eq!(output.new_tokens, vec![(running, 4)]);
        assert_eq!(engine.num_waiting(), 1);
        assert!(engine.cache_stats().num_used_blocks > 0);

        engine.abort_request(running).unwrap();
        engine.abort_request(waiting).unwrap();
        assert_eq!(engine.cache_stats().num_used_blocks, 0);
        assert!(matches!(
            engine.abort_request(running),
            Err(Error::RequestNotFound(_))
        ));

        let output = engine.step().unwrap();
        assert!(output.is_empty());
        assert!(!engine.has_unfinished_requests());
        let canceled = engine.take_output(running).unwrap().unwrap();
        assert_eq!(canceled.token_ids, vec![4]);
        assert!(matches!(
            canceled.into_result(),
            Err(Error::AbortedByUser(_))
        ));
    }

    #[test]
    fn handle_works_across_threads() {
        let (mut engine, _) = mock_engine(EngineConfig::default());
        let handle = engine.handle();
        let ids = std::thread::spawn(move || {
            (0..4)
                .map(|i| {
                    handle
                        .add_request(RequestInput::tokens(vec![i + 1]).with_max_new_tokens(50))
                        .unwrap()
                })
                .collect::<Vec<_>>()
        })
        .join()
        .unwrap();
        assert!(engine.has_unfinished_requests());

        let output = engine.step().unwrap();
        assert_eq!(output.new_tokens.len(), 4);

        engine.handle().abort(ids[2]).unwrap();
        let output = engine.step().unwrap();
        assert_eq!(output.aborted, vec![ids[2]]);
        assert!(output.new_tokens.iter().all(|(id, _)| *id != ids[2]));
        assert_eq!(output.new_tokens.len(), 3);

        // Unknown ids are ignored.
        engine.handle().abort(999).unwrap();
        assert!(engine.step().unwrap().aborted.is_empty());
    }

    #[test]
    fn executor_failure_aborts_the_batch() {
        let (executor, _) = MockExecutor::new();
        let mut engine = Engine::new(
            Box::new(executor.fail_on_call(1)),
            Box::new(GreedySampler::new([EOS])),
            Arc::new(ToyTokenizer),
            EngineConfig::default(),
        )
        .unwrap();
        let a = engine.add_request(vec![1, 2]).unwrap();
        let b = engine.add_request(vec![3, 4]).unwrap();
        engine.step().unwrap();

        let err = engine.step().unwrap_err();
        match err {
            Error::ExecutorFailure { request_ids, .. } => assert_eq!(request_ids, vec![a, b]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!engine.has_unfinished_requests());
        assert_eq!(engine.cache_stats().num_used_blocks, 0);
        let out = engine.take_output(a).unwrap().unwrap();
        assert_eq!(out.finish_reason, StopReason::Error);
        assert_eq!(out.token_ids, vec![3]);
    }

    #[test]
    fn recomputes_several_preempted_requests() {
        let (mut engine, _) = mock_engine(EngineConfig {
            block_size: 2,
            num_blocks: Some(3),
            max_input_len: 2,
            max_output_len: 4,
            ..Default::default()
        });
        let outputs = engine
            .generate([vec![1, 2], vec![5, 6], vec![9, 10]])
            .unwrap();
        let tokens: Vec<_> = outputs.iter().map(|o| o.token_ids.clone()).collect();
        assert_eq!(
            tokens,
            vec![vec![3, 4, 5, 6], vec![7, 8, 9, 10], vec![11, 12, 13, 14]]
        );
        assert!(outputs.iter().all(|o| o.finish_reason == StopReason::Length));
        assert_eq!(engine.num_preemptions(), 3);
        assert_eq!(engine.cache_stats().num_free_blocks, 3);
    }

    #[test]
    fn failed_step_keeps_pending_aborts() {
        let (executor, _) = MockExecutor::new();
        let mut engine = Engine::new(
            Box::new(executor.fail_on_call(1)),
            Box::new(GreedySampler::new([EOS])),
            Arc::new(ToyTokenizer),
            EngineConfig::default(),
        )
        .unwrap();
        let a = engine.add_request(vec![1, 2]).unwrap();
        let b = engine.add_request(vec![3, 4]).unwrap();
        let c = engine.add_request(vec![5, 6]).unwrap();
        engine.step().unwrap();

        engine.handle().abort(c).unwrap();
        match engine.step().unwrap_err() {
            Error::ExecutorFailure { request_ids, .. } => assert_eq!(request_ids, vec![a, b]),
            other => panic!("unexpected error {other:?}"),
        }
        let output = engine.step().unwrap();
        assert_eq!(output.aborted, vec![c]);
        assert_eq!(
            engine.take_output(c).unwrap().unwrap().finish_reason,
            StopReason::Canceled
        );
    }

    #[test]
    fn forked_request_shares_prefix() {
        let (mut engine, _) = mock_engine(EngineConfig {
            block_size: 4,
            ..Default::default()
        });
        let parent = engine
            .add_request(RequestInput::tokens(vec![1, 2, 3, 4, 5, 6]).with_max_new_tokens(4))
            .unwrap();
        engine.step().unwrap();
        let used = engine.cache_stats().num_used_blocks;
        let child = engine.fork_request(parent).unwrap();
        assert_eq!(engine.cache_stats().num_used_blocks, used);

        while engine.has_unfinished_requests() {
            engine.step().unwrap();
            engine.scheduler.check_invariants().unwrap();
        }
        let parent_out = engine.take_output(parent).unwrap().unwrap();
        let child_out = engine.take_output(child).unwrap().unwrap();
        assert_eq!(parent_out.token_ids, vec![7, 8, 9, 10]);
        assert_eq!(child_out.token_ids, parent_out.token_ids);
        assert_eq!(engine.cache_stats().num_used_blocks, 0);
    }
}
