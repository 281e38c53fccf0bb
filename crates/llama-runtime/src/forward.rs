//! Transformer forward pass over a loaded [`ModelWeights`].
//!
//! Provides:
//! - **RmsNorm**: root-mean-square normalization with a learned scale
//! - **Rope**: rotary position embeddings on the first `n_rot` dims of a head
//! - **Transformer**: the per-layer attention + SwiGLU feed-forward stack,
//!   writing keys and values into a [`SessionKVCache`]
//!
//! Every matrix product goes through [`WorkerPool::matmul`]; attention heads
//! of one token run in parallel on the same pool. All arithmetic is f32,
//! whatever the KV cache stores.

use rayon::prelude::*;

use llama_engine::{LlamaError, Result, TokenId};
use llama_kv::SessionKVCache;
use llama_models::{expected_tensors, HParams, ModelWeights, Tensor};

use crate::pool::WorkerPool;

/// Epsilon added to the mean square before the square root.
pub const RMS_NORM_EPS: f32 = 1e-6;

/// Frequency base of the rotary embedding.
pub const ROPE_BASE: f32 = 10000.0;

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / sqrt(mean(x^2) + eps) * weight`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learned scale, shape: [n_embd]
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RmsNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    /// Dequantize a 1-D norm weight.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        if t.n_dims() != 1 {
            return Err(LlamaError::Format(format!(
                "{}: norm weight must be 1-D, got shape {:?}",
                t.name(),
                t.shape()
            )));
        }
        Ok(Self::new(t.to_f32_vec()?, RMS_NORM_EPS))
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    /// Normalize one row of `dim()` values into `out`.
    pub fn forward(&self, x: &[f32], out: &mut [f32]) {
        let mean_sq: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let scale = 1.0 / (mean_sq + self.eps).sqrt();
        for ((o, &v), &w) in out.iter_mut().zip(x).zip(&self.weight) {
            *o = v * scale * w;
        }
    }
}

/// Rotary Position Embeddings.
///
/// Rotates each pair `(2j, 2j + 1)` of the first `n_rot` dims of a head by
/// `pos * base^(-2j / n_rot)`. Dims past `n_rot` pass through unchanged.
#[derive(Debug, Clone)]
pub struct Rope {
    n_rot: usize,
    /// Inverse frequencies: `base^(-2j / n_rot)` for `j in 0..n_rot / 2`.
    inv_freq: Vec<f32>,
}

impl Rope {
    pub fn new(n_rot: usize, base: f32) -> Self {
        let inv_freq = (0..n_rot / 2)
            .map(|j| 1.0 / base.powf(2.0 * j as f32 / n_rot as f32))
            .collect();
        Self { n_rot, inv_freq }
    }

    pub fn n_rot(&self) -> usize {
        self.n_rot
    }

    /// Rotate every head of `row` (heads of `head_dim` values) in place.
    pub fn apply(&self, row: &mut [f32], head_dim: usize, pos: usize) {
        let pos = pos as f32;
        for head in row.chunks_exact_mut(head_dim) {
            for (j, &freq) in self.inv_freq.iter().enumerate() {
                let (sin, cos) = (pos * freq).sin_cos();
                let x0 = head[2 * j];
                let x1 = head[2 * j + 1];
                head[2 * j] = x0 * cos - x1 * sin;
                head[2 * j + 1] = x0 * sin + x1 * cos;
            }
        }
    }
}

/// `x * sigmoid(x)`
#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Max-subtracted softmax in place.
pub fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Fallible zeroed buffer; exhaustion surfaces as `Allocation`.
pub(crate) fn zeros(n: usize) -> Result<Vec<f32>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)?;
    v.resize(n, 0.0);
    Ok(v)
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `n_rows × n_vocab` logits, row-major.
    pub logits: Vec<f32>,
    pub n_rows: usize,
    /// Final-normalised hidden state of the last token.
    pub embedding: Vec<f32>,
}

/// Every buffer one forward pass writes, allocated up front so the pass
/// itself never allocates.
#[derive(Debug)]
pub struct Scratch {
    n_tokens: usize,
    n_rows: usize,
    /// Residual stream, one row per token.
    x: Vec<f32>,
    cur: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    attn: Vec<f32>,
    proj: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    /// Attention weights, `n_ctx` slots per head.
    scores: Vec<f32>,
    logits: Vec<f32>,
}

impl Scratch {
    /// Buffers for `n_tokens` tokens against a cache of `n_ctx` positions.
    pub fn new(hparams: &HParams, n_tokens: usize, n_ctx: usize, logits_all: bool) -> Result<Self> {
        if n_tokens == 0 {
            return Err(LlamaError::InvalidArgument("no tokens to evaluate".into()));
        }
        let n_embd = hparams.n_embd;
        let n_ff = hparams.n_ff();
        let n_rows = if logits_all { n_tokens } else { 1 };
        let x_len = n_tokens
            .checked_mul(n_embd)
            .ok_or_else(|| LlamaError::Allocation(format!("{n_tokens} rows of {n_embd}")))?;
        let logits_len = n_rows
            .checked_mul(hparams.n_vocab)
            .ok_or_else(|| LlamaError::Allocation(format!("{n_rows} logit rows")))?;
        let scores_len = hparams
            .n_head
            .checked_mul(n_ctx)
            .ok_or_else(|| LlamaError::Allocation(format!("{n_ctx} attention slots")))?;
        Ok(Self {
            n_tokens,
            n_rows,
            x: zeros(x_len)?,
            cur: zeros(n_embd)?,
            q: zeros(n_embd)?,
            k: zeros(n_embd)?,
            v: zeros(n_embd)?,
            attn: zeros(n_embd)?,
            proj: zeros(n_embd)?,
            gate: zeros(n_ff)?,
            up: zeros(n_ff)?,
            scores: zeros(scores_len)?,
            logits: zeros(logits_len)?,
        })
    }
}

/// The decoder stack, with norm weights dequantized once up front.
#[derive(Debug, Clone)]
pub struct Transformer {
    hparams: HParams,
    rope: Rope,
    attention_norms: Vec<RmsNorm>,
    ffn_norms: Vec<RmsNorm>,
    norm: RmsNorm,
}

impl Transformer {
    pub fn new(hparams: &HParams, weights: &ModelWeights) -> Result<Self> {
        if weights.layers.len() != hparams.n_layer {
            return Err(LlamaError::Format(format!(
                "{} layers of weights for n_layer {}",
                weights.layers.len(),
                hparams.n_layer
            )));
        }
        for (expected, tensor) in expected_tensors(hparams).iter().zip(weights.tensors()) {
            if tensor.shape() != expected.shape.as_slice() {
                return Err(LlamaError::Format(format!(
                    "{}: shape {:?}, expected {:?}",
                    expected.name,
                    tensor.shape(),
                    expected.shape
                )));
            }
        }
        let attention_norms = weights
            .layers
            .iter()
            .map(|l| RmsNorm::from_tensor(&l.attention_norm))
            .collect::<Result<Vec<_>>>()?;
        let ffn_norms = weights
            .layers
            .iter()
            .map(|l| RmsNorm::from_tensor(&l.ffn_norm))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            hparams: *hparams,
            rope: Rope::new(hparams.n_rot, ROPE_BASE),
            attention_norms,
            ffn_norms,
            norm: RmsNorm::from_tensor(&weights.norm)?,
        })
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()`.
    ///
    /// Keys and values are written into `kv` at those positions; committing
    /// them is left to the caller. Returns logits for the last token, or for
    /// every token when `scratch` was sized with `logits_all`.
    pub fn forward(
        &self,
        weights: &ModelWeights,
        kv: &mut SessionKVCache,
        pool: &WorkerPool,
        tokens: &[TokenId],
        n_past: usize,
        mut scratch: Scratch,
    ) -> Result<ForwardOutput> {
        let n_embd = self.hparams.n_embd;
        let n_vocab = self.hparams.n_vocab;
        let head_dim = self.hparams.head_dim();
        let n = tokens.len();
        if n != scratch.n_tokens {
            return Err(LlamaError::InvalidArgument(format!(
                "scratch sized for {} tokens, got {n}",
                scratch.n_tokens
            )));
        }
        tracing::debug!(n_tokens = n, n_past, "forward pass");

        let Scratch {
            x,
            cur,
            q,
            k,
            v,
            attn,
            proj,
            gate,
            up,
            scores,
            ..
        } = &mut scratch;

        for (row, &token) in x.chunks_exact_mut(n_embd).zip(tokens) {
            let id = usize::try_from(token).map_err(|_| {
                LlamaError::InvalidArgument(format!("negative token id {token}"))
            })?;
            weights.tok_embeddings.read_row(id, row)?;
        }

        for (il, layer) in weights.layers.iter().enumerate() {
            for (i, xi) in x.chunks_exact_mut(n_embd).enumerate() {
                let pos = n_past + i;

                // self-attention
                self.attention_norms[il].forward(xi, cur);
                pool.matmul(&layer.wq, cur, q)?;
                pool.matmul(&layer.wk, cur, k)?;
                pool.matmul(&layer.wv, cur, v)?;
                self.rope.apply(q, head_dim, pos);
                self.rope.apply(k, head_dim, pos);
                kv.store(il, pos, k, v)?;
                attend(kv, pool, il, pos, head_dim, q, scores, attn)?;
                pool.matmul(&layer.wo, attn, proj)?;
                add_assign(xi, proj);

                // feed-forward
                self.ffn_norms[il].forward(xi, cur);
                pool.matmul(&layer.w1, cur, gate)?;
                pool.matmul(&layer.w3, cur, up)?;
                for (g, &u) in gate.iter_mut().zip(up.iter()) {
                    *g = silu(*g) * u;
                }
                pool.matmul(&layer.w2, gate, proj)?;
                add_assign(xi, proj);
            }
        }

        let n_rows = scratch.n_rows;
        let first = n - n_rows;
        for (row, out) in scratch
            .x
            .chunks_exact(n_embd)
            .skip(first)
            .zip(scratch.logits.chunks_exact_mut(n_vocab))
        {
            self.norm.forward(row, &mut scratch.cur);
            pool.matmul(&weights.output, &scratch.cur, out)?;
        }
        // `cur` now holds the normalised last row.
        Ok(ForwardOutput {
            logits: scratch.logits,
            n_rows,
            embedding: scratch.cur,
        })
    }
}

/// Causal attention of the query at `pos` over cached positions `0..=pos`,
/// heads in parallel. `scores` holds one slot per cached position per head.
#[allow(clippy::too_many_arguments)]
fn attend(
    kv: &SessionKVCache,
    pool: &WorkerPool,
    layer: usize,
    pos: usize,
    head_dim: usize,
    q: &[f32],
    scores: &mut [f32],
    out: &mut [f32],
) -> Result<()> {
    let n_heads = out.len() / head_dim;
    let slots = scores.len() / n_heads.max(1);
    if pos >= slots {
        return Err(LlamaError::ContextOverflow {
            n_past: pos,
            n_tokens: 1,
            n_ctx: slots,
        });
    }
    let scale = 1.0 / (head_dim as f32).sqrt();
    pool.install(|| {
        out.par_chunks_mut(head_dim)
            .zip(scores.par_chunks_mut(slots))
            .enumerate()
            .try_for_each(|(h, (dst, slot))| -> Result<()> {
                let qh = &q[h * head_dim..(h + 1) * head_dim];
                let weights = &mut slot[..=pos];
                for (p, s) in weights.iter_mut().enumerate() {
                    *s = kv.dot_key(layer, p, h, qh)? * scale;
                }
                softmax_in_place(weights);
                dst.fill(0.0);
                for (p, &w) in weights.iter().enumerate() {
                    kv.accumulate_value(layer, p, h, w, dst)?;
                }
                Ok(())
            })
    })
}

fn add_assign(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}
