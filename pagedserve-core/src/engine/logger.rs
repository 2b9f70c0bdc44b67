#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

pub struct IntervalLogger {
    interval: Duration,
    enabled: AtomicBool,
    stop: Arc<AtomicBool>,
    tokens_processed: Arc<AtomicUsize>,
    total_new_seqs: Arc<AtomicUsize>,
    num_preemptions: Arc<AtomicUsize>,
    num_running: Arc<AtomicUsize>,
    num_waiting: Arc<AtomicUsize>,
    /// KV cache usage in hundredths of a percent.
    cache_usage: Arc<AtomicUsize>,
}

impl IntervalLogger {
    /// Creates an interval logger. Call `enable_logging` to start the logging thread.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            enabled: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            tokens_processed: Arc::new(AtomicUsize::new(0)),
            total_new_seqs: Arc::new(AtomicUsize::new(0)),
            num_preemptions: Arc::new(AtomicUsize::new(0)),
            num_running: Arc::new(AtomicUsize::new(0)),
            num_waiting: Arc::new(AtomicUsize::new(0)),
            cache_usage: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn the logging thread. Later calls do nothing.
    pub fn enable_logging(&self) {
        if self.enabled.swap(true, Ordering::Relaxed) {
            return;
        }
        let interval = self.interval;
        let t_stop = self.stop.clone();
        let t_tokens_processed = self.tokens_processed.clone();
        let t_total_new_seqs = self.total_new_seqs.clone();
        let t_num_preemptions = self.num_preemptions.clone();
        let t_num_running = self.num_running.clone();
        let t_num_waiting = self.num_waiting.clone();
        let t_cache_usage = self.cache_usage.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if t_stop.load(Ordering::Relaxed) {
                break;
            }

            let total_new_seqs = t_total_new_seqs.load(Ordering::Relaxed);
            let tokens_processed = t_tokens_processed.swap(0, Ordering::Relaxed);
            let num_preemptions = t_num_preemptions.load(Ordering::Relaxed);
            let num_running = t_num_running.load(Ordering::Relaxed);
            let num_waiting = t_num_waiting.load(Ordering::Relaxed);
            let cache_usage = t_cache_usage.load(Ordering::Relaxed);

            if total_new_seqs != 0 && tokens_processed != 0 {
                // Prefill and decode tokens of this window only.
                info!(
                    "Throughput (T/s) {:.2}, KV cache usage {:.2}%, {num_preemptions} preemptions, {num_running} running, {num_waiting} waiting",
                    tokens_processed as f64 / interval.as_secs_f64(),
                    cache_usage as f64 / 100.,
                );
            }
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn add_tokens_processed(&self, num_tokens: usize) {
        self.tokens_processed
            .fetch_add(num_tokens, Ordering::Relaxed);
    }

    pub fn add_new_sequence(&self) {
        self.total_new_seqs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_preemptions(&self, num_preemptions: usize) {
        self.num_preemptions
            .fetch_add(num_preemptions, Ordering::Relaxed);
    }

    pub fn set_num_running(&self, running: usize) {
        self.num_running.store(running, Ordering::Relaxed);
    }

    pub fn set_num_waiting(&self, waiting: usize) {
        self.num_waiting.store(waiting, Ordering::Relaxed);
    }

    pub fn set_cache_usage(&self, usage: f64) {
        self.cache_usage
            .store((usage * 10_000.).round() as usize, Ordering::Relaxed);
    }

    /// Cumulative (new sequences, preemptions).
    pub fn totals(&self) -> (usize, usize) {
        (
            self.total_new_seqs.load(Ordering::Relaxed),
            self.num_preemptions.load(Ordering::Relaxed),
        )
    }
}

impl Drop for IntervalLogger {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
