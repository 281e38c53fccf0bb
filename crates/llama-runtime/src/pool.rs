//! Worker pool for the forward pass.
//!
//! A [`WorkerPool`] owns a dedicated `rayon` pool with a fixed thread count.
//! Matrix products split the weight's output rows into `n_threads`
//! contiguous, near-equal chunks; each worker writes its own disjoint slice
//! of the output, so no locking or cross-thread reduction is needed.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use llama_engine::{LlamaError, Result};
use llama_models::Tensor;

pub struct WorkerPool {
    pool: ThreadPool,
    n_threads: usize,
}

impl WorkerPool {
    pub fn new(n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(LlamaError::InvalidArgument(
                "n_threads must be at least 1".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("llama-worker-{i}"))
            .build()
            .map_err(|e| LlamaError::Allocation(format!("worker pool: {e}")))?;
        tracing::debug!(n_threads, "worker pool started");
        Ok(Self { pool, n_threads })
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Rows per worker for a product with `n_rows` outputs.
    pub fn chunk_len(&self, n_rows: usize) -> usize {
        n_rows.div_ceil(self.n_threads).max(1)
    }

    /// `out = W · x`, one output per weight row.
    ///
    /// `x.len()` must equal `w.row_len()` and `out.len()` must equal
    /// `w.n_rows()`.
    pub fn matmul(&self, w: &Tensor, x: &[f32], out: &mut [f32]) -> Result<()> {
        if out.len() != w.n_rows() {
            return Err(LlamaError::InvalidArgument(format!(
                "{}: {} outputs for {} rows",
                w.name(),
                out.len(),
                w.n_rows()
            )));
        }
        let chunk = self.chunk_len(out.len());
        if self.n_threads == 1 {
            return w.dot_rows(0..out.len(), x, out);
        }
        self.pool.install(|| {
            out.par_chunks_mut(chunk)
                .enumerate()
                .try_for_each(|(i, dst)| {
                    let start = i * chunk;
                    w.dot_rows(start..start + dst.len(), x, dst)
                })
        })
    }

    /// Run `op` inside the pool so nested parallel iterators use its workers.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("n_threads", &self.n_threads)
            .finish()
    }
}
