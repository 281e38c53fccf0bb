//! Per-context performance counters.
//!
//! Provides:
//! - [`Timings`]: load, sampling and evaluation counters owned by a context
//! - [`TimingReport`]: a point-in-time summary with per-token rates

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Accumulated timing counters for one context.
#[derive(Debug, Clone)]
pub struct Timings {
    start: Instant,
    load: Duration,
    n_sample: usize,
    sample: Duration,
    n_eval_calls: usize,
    n_eval_tokens: usize,
    eval: Duration,
}

impl Timings {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            load: Duration::ZERO,
            n_sample: 0,
            sample: Duration::ZERO,
            n_eval_calls: 0,
            n_eval_tokens: 0,
            eval: Duration::ZERO,
        }
    }

    pub fn record_load(&mut self, elapsed: Duration) {
        self.load = elapsed;
    }

    pub fn record_sample(&mut self, elapsed: Duration) {
        self.n_sample += 1;
        self.sample += elapsed;
    }

    /// One successful `eval` over `n_tokens` tokens.
    pub fn record_eval(&mut self, n_tokens: usize, elapsed: Duration) {
        self.n_eval_calls += 1;
        self.n_eval_tokens += n_tokens;
        self.eval += elapsed;
    }

    /// Zero the sample and eval counters and restart the wall clock.
    /// Load time is kept.
    pub fn reset(&mut self) {
        *self = Self {
            load: self.load,
            ..Self::new()
        };
    }

    pub fn report(&self) -> TimingReport {
        TimingReport {
            load_ms: ms(self.load),
            sample_count: self.n_sample,
            sample_ms: ms(self.sample),
            sample_ms_per_token: per(self.sample, self.n_sample),
            eval_calls: self.n_eval_calls,
            eval_tokens: self.n_eval_tokens,
            eval_ms: ms(self.eval),
            eval_ms_per_token: per(self.eval, self.n_eval_tokens),
            total_ms: ms(self.start.elapsed()),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::new()
    }
}

fn ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

fn per(d: Duration, n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        ms(d) / n as f64
    }
}

/// Summary of a context's [`Timings`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingReport {
    pub load_ms: f64,
    pub sample_count: usize,
    pub sample_ms: f64,
    pub sample_ms_per_token: f64,
    pub eval_calls: usize,
    pub eval_tokens: usize,
    pub eval_ms: f64,
    pub eval_ms_per_token: f64,
    /// Wall clock since the context was created or timings were last reset.
    pub total_ms: f64,
}

impl TimingReport {
    /// Evaluated tokens per second; 0 before the first eval.
    pub fn eval_tokens_per_sec(&self) -> f64 {
        if self.eval_ms > 0.0 {
            self.eval_tokens as f64 * 1000.0 / self.eval_ms
        } else {
            0.0
        }
    }
}

impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "load time   = {:10.2} ms", self.load_ms)?;
        writeln!(
            f,
            "sample time = {:10.2} ms / {:5} runs   ({:8.2} ms per run)",
            self.sample_ms, self.sample_count, self.sample_ms_per_token
        )?;
        writeln!(
            f,
            "eval time   = {:10.2} ms / {:5} tokens ({:8.2} ms per token)",
            self.eval_ms, self.eval_tokens, self.eval_ms_per_token
        )?;
        write!(f, "total time  = {:10.2} ms", self.total_ms)
    }
}
