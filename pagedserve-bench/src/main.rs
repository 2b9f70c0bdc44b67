use std::fmt::Display;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use pagedserve_core::{
    initialize_logging, Engine, EngineConfig, GreedySampler, ModelConfigLike,
    ModelConfigMetadata, ModelExecutor, RequestInput, ScheduledBatch, TokenizerLike,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

/// Stands in for a model: the next token is a deterministic hash of the last input token
/// and its position.
struct SyntheticExecutor {
    device: Device,
    model: ModelConfigMetadata,
    vocab_size: usize,
}

impl ModelExecutor for SyntheticExecutor {
    fn device(&self) -> &Device {
        &self.device
    }

    fn model_config(&self) -> &dyn ModelConfigLike {
        &self.model
    }

    fn forward(&mut self, batch: &ScheduledBatch) -> anyhow::Result<Tensor> {
        let mut logits = vec![0f32; batch.len() * self.vocab_size];
        for (row, seq) in batch.seqs.iter().enumerate() {
            let Some(&last) = seq.input_tokens.last() else {
                anyhow::bail!("request {} was scheduled without input", seq.request_id);
            };
            let pos = seq.context_len() as u64;
            let next = (u64::from(last)
                .wrapping_mul(6364136223846793005)
                .wrapping_add(pos)
                >> 33) as usize
                % self.vocab_size;
            logits[row * self.vocab_size + next] = 1.;
        }
        Ok(Tensor::from_vec(
            logits,
            (batch.len(), self.vocab_size),
            &self.device,
        )?)
    }
}

/// Token ids rendered as space-separated integers.
struct NumericTokenizer;

impl TokenizerLike for NumericTokenizer {
    fn encode(&self, text: &str) -> pagedserve_core::Result<Vec<u32>> {
        text.split_whitespace()
            .map(|t| {
                t.parse::<u32>()
                    .map_err(|e| pagedserve_core::Error::Tokenizer(e.to_string()))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> pagedserve_core::Result<String> {
        Ok(ids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" "))
    }
}

struct UncertainTokSec {
    mean: f32,
    std_dev: f32,
}

impl Display for UncertainTokSec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

#[derive(Default)]
struct RunStats {
    generated_tokens: usize,
    steps: usize,
    preemptions: usize,
    tok_per_sec: f32,
}

struct BenchResult {
    max_batch_size: usize,
    num_requests: usize,
    runs: Vec<RunStats>,
}

impl BenchResult {
    #[allow(clippy::cast_precision_loss)]
    fn tok_s(&self) -> UncertainTokSec {
        let n = self.runs.len() as f32;
        let mean = self.runs.iter().map(|r| r.tok_per_sec).sum::<f32>() / n;
        let variance = self
            .runs
            .iter()
            .map(|r| (mean - r.tok_per_sec).powf(2.))
            .sum::<f32>()
            / n;
        UncertainTokSec {
            mean,
            std_dev: variance.sqrt(),
        }
    }

    fn last(&self) -> &RunStats {
        &self.runs[self.runs.len() - 1]
    }
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Integer seed for the synthetic workload.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Engine configuration file (JSON). Command line options override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of requests per run.
    #[arg(long, short = 'n', default_value_t = 64)]
    num_requests: usize,

    /// Minimum and maximum prompt length.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [16, 256])]
    prompt_len: Vec<usize>,

    /// Minimum and maximum number of generated tokens.
    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], default_values_t = [16, 128])]
    gen_len: Vec<usize>,

    /// Maximum number of running sequences. Several comma-separated values run one
    /// benchmark each.
    #[clap(short, long, value_parser, value_delimiter = ',')]
    concurrency: Option<Vec<usize>>,

    /// Number of times to repeat each test.
    #[arg(long, short, default_value_t = 3)]
    repetitions: usize,

    /// Tokens per KV cache block.
    #[arg(long = "block-size")]
    block_size: Option<usize>,

    /// Number of KV cache blocks.
    #[arg(long = "num-blocks")]
    num_blocks: Option<usize>,

    /// KV cache memory budget in MBs. `num-blocks` takes priority.
    #[arg(long = "cache-mem")]
    cache_memory_mb: Option<usize>,

    /// Vocabulary size of the synthetic model.
    #[arg(long, default_value_t = 32000)]
    vocab_size: usize,

    /// End-of-sequence token of the synthetic model.
    #[arg(long, default_value_t = 2)]
    eos_token: u32,

    /// Submit requests from a separate producer thread while the engine runs.
    #[arg(long, default_value_t = false)]
    concurrent_producer: bool,

    /// Print the results as JSON instead of a table.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn workload(args: &Args) -> Vec<RequestInput> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let vocab = u32::try_from(args.vocab_size).unwrap_or(u32::MAX);
    (0..args.num_requests)
        .map(|_| {
            let len = rng.gen_range(args.prompt_len[0]..=args.prompt_len[1]);
            let tokens = (0..len).map(|_| rng.gen_range(3..vocab)).collect();
            let max_new = rng.gen_range(args.gen_len[0]..=args.gen_len[1]);
            RequestInput::tokens(tokens).with_max_new_tokens(max_new)
        })
        .collect()
}

fn build_engine(args: &Args, base: &EngineConfig, max_batch_size: usize) -> anyhow::Result<Engine> {
    let config = EngineConfig {
        max_batch_size,
        max_input_len: base.max_input_len.max(args.prompt_len[1]),
        max_output_len: base.max_output_len.max(args.gen_len[1]),
        block_size: args.block_size.unwrap_or(base.block_size),
        num_blocks: args.num_blocks.or(base.num_blocks),
        cache_memory_mb: args.cache_memory_mb.or(base.cache_memory_mb),
        ..base.clone()
    };
    let executor = SyntheticExecutor {
        device: Device::Cpu,
        model: ModelConfigMetadata {
            num_layers: 32,
            hidden_size: 4096,
            num_kv_heads: 8,
            num_attn_heads: 32,
        },
        vocab_size: args.vocab_size,
    };
    Ok(Engine::new(
        Box::new(executor),
        Box::new(GreedySampler::new([args.eos_token])),
        std::sync::Arc::new(NumericTokenizer),
        config,
    )?)
}

#[allow(clippy::cast_precision_loss)]
fn run_once(
    args: &Args,
    base: &EngineConfig,
    max_batch_size: usize,
    requests: &[RequestInput],
) -> anyhow::Result<RunStats> {
    let mut engine = build_engine(args, base, max_batch_size)?;
    let mut stats = RunStats::default();
    let start = Instant::now();

    let producer = if args.concurrent_producer {
        let handle = engine.handle();
        let requests = requests.to_vec();
        Some(thread::spawn(move || -> pagedserve_core::Result<()> {
            for request in requests {
                handle.add_request(request)?;
                thread::sleep(Duration::from_micros(50));
            }
            Ok(())
        }))
    } else {
        for request in requests {
            engine.add_request(request.clone())?;
        }
        None
    };

    loop {
        let producing = producer.as_ref().is_some_and(|p| !p.is_finished());
        if !producing && !engine.has_unfinished_requests() {
            break;
        }
        let output = engine.step()?;
        if output.new_tokens.is_empty() {
            thread::yield_now();
        }
        stats.generated_tokens += output.new_tokens.len();
    }
    if let Some(producer) = producer {
        producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    }

    stats.steps = engine.num_steps();
    stats.preemptions = engine.num_preemptions();
    stats.tok_per_sec = stats.generated_tokens as f32 / start.elapsed().as_secs_f32();
    Ok(stats)
}

fn print_usage(results: &[BenchResult]) {
    let rows: Vec<Vec<CellStruct>> = results
        .iter()
        .map(|r| {
            vec![
                r.max_batch_size.cell().justify(Justify::Right),
                r.num_requests.cell().justify(Justify::Right),
                r.last().generated_tokens.cell().justify(Justify::Right),
                r.last().steps.cell().justify(Justify::Right),
                r.last().preemptions.cell().justify(Justify::Right),
                r.tok_s().cell().justify(Justify::Right),
            ]
        })
        .collect();

    let table = rows
        .table()
        .title(vec![
            "concurrency".cell().bold(true),
            "requests".cell().bold(true),
            "generated".cell().bold(true),
            "steps".cell().bold(true),
            "preemptions".cell().bold(true),
            "t/s".cell().bold(true),
        ])
        .bold(true);
    if let Err(e) = print_stdout(table) {
        tracing::error!("Failed to print results: {e}");
    }
}

fn print_json(results: &[BenchResult]) -> anyhow::Result<()> {
    let rows: Vec<serde_json::Value> = results
        .iter()
        .map(|r| {
            let tok_s = r.tok_s();
            serde_json::json!({
                "concurrency": r.max_batch_size,
                "requests": r.num_requests,
                "generated": r.last().generated_tokens,
                "steps": r.last().steps,
                "preemptions": r.last().preemptions,
                "tok_per_sec": tok_s.mean,
                "tok_per_sec_std": tok_s.std_dev,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let mut args = Args::parse();
    initialize_logging();

    args.concurrency = Some(args.concurrency.unwrap_or(vec![8]));
    for (name, range) in [("prompt-len", &args.prompt_len), ("gen-len", &args.gen_len)] {
        if range[0] == 0 || range[0] > range[1] {
            anyhow::bail!("`{name}` must be a non-empty range of positive integers, got {range:?}.");
        }
    }
    if args.repetitions == 0 {
        anyhow::bail!("`repetitions` must be a strictly positive integer, got 0.");
    }
    if args.vocab_size <= 3 {
        anyhow::bail!("`vocab-size` must be greater than 3.");
    }

    let base = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let requests = workload(&args);
    info!(
        "Generated a workload of {} requests with seed {}.",
        requests.len(),
        args.seed
    );

    let mut results = Vec::new();
    for &max_batch_size in args.concurrency.as_ref().into_iter().flatten() {
        info!("Starting benchmark with concurrency {max_batch_size}.");
        let runs = (0..args.repetitions)
            .map(|_| run_once(&args, &base, max_batch_size, &requests))
            .collect::<anyhow::Result<Vec<_>>>()?;
        results.push(BenchResult {
            max_batch_size,
            num_requests: requests.len(),
            runs,
        });
    }

    if args.json {
        print_json(&results)?;
    } else {
        print_usage(&results);
    }
    Ok(())
}
