//! Evaluation context: the mutable per-session state over a shared model.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use llama_engine::{ContextParams, LlamaError, Result, StatusCode, TokenId};
use llama_kv::{KVShape, SessionKVCache};
use llama_models::Model;
use llama_sampling::{SamplingParams, SeededRng};
use llama_tokenizer::{SpmTokenizer, Tokenizer, TokenizerError};

use crate::forward::{zeros, Scratch, Transformer};
use crate::pool::WorkerPool;
use crate::timings::{TimingReport, Timings};

/// Forward-pass state; absent for vocabulary-only models.
#[derive(Debug)]
struct Engine {
    transformer: Transformer,
    kv: SessionKVCache,
}

/// A session over an `Arc<Model>`.
///
/// Owns the KV cache, the logits and embedding buffers, the sampling RNG,
/// the worker pool and the timing counters. Invariant: the committed KV
/// positions are exactly `0..n_past()` and `n_past() <= n_ctx()`.
///
/// Dropping the context releases everything it owns; the model is unmapped
/// once its last `Arc` goes.
#[derive(Debug)]
pub struct Context {
    id: Uuid,
    model: Arc<Model>,
    params: ContextParams,
    tokenizer: SpmTokenizer,
    engine: Option<Engine>,
    logits: Vec<f32>,
    embeddings: Vec<f32>,
    rng: SeededRng,
    pool: Option<WorkerPool>,
    timings: Timings,
}

impl Context {
    /// Load the model at `path` and create a context over it.
    pub fn init(path: impl AsRef<Path>, params: ContextParams) -> Result<Self> {
        let start = Instant::now();
        let model = Arc::new(Model::load(path, &params)?);
        let mut ctx = Self::with_model(model, params)?;
        ctx.timings.record_load(start.elapsed());
        Ok(ctx)
    }

    /// Create a context over an already loaded model.
    pub fn with_model(model: Arc<Model>, params: ContextParams) -> Result<Self> {
        let id = Uuid::new_v4();
        let hparams = *model.hparams();

        let engine = match model.weights() {
            Some(weights) => {
                let transformer = Transformer::new(&hparams, weights)?;
                let shape = KVShape::new(params.n_ctx(), hparams.n_head, hparams.head_dim());
                let kv = SessionKVCache::new(hparams.n_layer, shape, params.kv_precision())?;
                Some(Engine { transformer, kv })
            }
            None => None,
        };

        let logits = zeros(hparams.n_vocab)?;
        let embeddings = if params.embedding() {
            zeros(hparams.n_embd)?
        } else {
            Vec::new()
        };
        let seed = params.seed().unwrap_or_else(time_seed);

        tracing::info!(
            ctx = %id,
            n_ctx = params.n_ctx(),
            kv_precision = %params.kv_precision(),
            kv_bytes = engine.as_ref().map_or(0, |e| e.kv.memory_bytes()),
            seed,
            "context created"
        );

        Ok(Self {
            id,
            tokenizer: SpmTokenizer::new(Arc::clone(model.vocab())),
            model,
            params,
            engine,
            logits,
            embeddings,
            rng: SeededRng::new(seed),
            pool: None,
            timings: Timings::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Evaluate `tokens` at positions `n_past..n_past + tokens.len()` using
    /// `n_threads` workers.
    ///
    /// `n_past` may be smaller than [`Context::n_past`] to discard the tail
    /// of the cache and re-evaluate from there. Every argument is checked
    /// before anything is touched, so a failed call leaves the context as it
    /// was.
    pub fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()> {
        let span = tracing::debug_span!("eval", ctx = %self.id, n_tokens = tokens.len(), n_past);
        let _enter = span.enter();
        let start = Instant::now();

        if tokens.is_empty() {
            return Err(LlamaError::InvalidArgument("no tokens to evaluate".into()));
        }
        if n_threads == 0 {
            return Err(LlamaError::InvalidArgument(
                "n_threads must be at least 1".into(),
            ));
        }
        if self.engine.is_none() {
            return Err(LlamaError::InvalidArgument(
                "model was loaded without weights".into(),
            ));
        }
        let n_vocab = self.n_vocab();
        if let Some(&bad) = tokens
            .iter()
            .find(|&&t| usize::try_from(t).map_or(true, |t| t >= n_vocab))
        {
            return Err(LlamaError::InvalidArgument(format!(
                "token id {bad} outside vocabulary of {n_vocab}"
            )));
        }
        let n_ctx = self.n_ctx();
        if n_past.checked_add(tokens.len()).map_or(true, |end| end > n_ctx) {
            return Err(LlamaError::ContextOverflow {
                n_past,
                n_tokens: tokens.len(),
                n_ctx,
            });
        }
        let current = self.n_past();
        if n_past > current {
            return Err(LlamaError::InvalidArgument(format!(
                "n_past {n_past} is ahead of the {current} evaluated positions"
            )));
        }
        self.ensure_pool(n_threads)?;
        let scratch = Scratch::new(
            self.model.hparams(),
            tokens.len(),
            n_ctx,
            self.params.logits_all(),
        )?;

        let missing = || LlamaError::InvalidArgument("model was loaded without weights".into());
        let weights = self.model.weights().ok_or_else(missing)?;
        let engine = self.engine.as_mut().ok_or_else(missing)?;
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| LlamaError::InvalidArgument("worker pool unavailable".into()))?;

        // Nothing below allocates; shapes were checked when the engine was built.
        engine.kv.truncate(n_past)?;
        let out = engine
            .transformer
            .forward(weights, &mut engine.kv, pool, tokens, n_past, scratch)?;
        engine.kv.commit(n_past + tokens.len())?;

        self.logits = out.logits;
        if self.params.embedding() {
            self.embeddings = out.embedding;
        }
        let elapsed = start.elapsed();
        self.timings.record_eval(tokens.len(), elapsed);
        tracing::debug!(
            n_past = self.n_past(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "eval done"
        );
        Ok(())
    }

    /// [`Context::eval`] collapsed to a status code.
    pub fn eval_status(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> StatusCode {
        StatusCode::of(&self.eval(tokens, n_past, n_threads))
    }

    fn ensure_pool(&mut self, n_threads: usize) -> Result<()> {
        if self.pool.as_ref().map(WorkerPool::n_threads) != Some(n_threads) {
            self.pool = Some(WorkerPool::new(n_threads)?);
        }
        Ok(())
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        Ok(self.tokenizer.encode(text, add_bos)?)
    }

    /// Tokenize into `out`; fails with `BufferTooSmall` carrying the exact
    /// required length and leaves `out` untouched when it is too short.
    pub fn tokenize_into(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> Result<usize> {
        Ok(self.tokenizer.encode_into(text, add_bos, out)?)
    }

    /// Sentinel form of [`Context::tokenize_into`]: the token count, or the
    /// negated required count when `out` is too short. Text that cannot be
    /// encoded yields `i32::MIN`.
    pub fn tokenize_status(&self, text: &str, add_bos: bool, out: &mut [TokenId]) -> i32 {
        match self.tokenizer.encode_into(text, add_bos, out) {
            Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Err(TokenizerError::BufferTooSmall { required, .. }) => {
                -i32::try_from(required).unwrap_or(i32::MAX)
            }
            Err(e) => {
                tracing::warn!(ctx = %self.id, error = %e, "tokenize failed");
                i32::MIN
            }
        }
    }

    /// Concatenated text of `tokens`.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        Ok(self.tokenizer.decode(tokens)?)
    }

    /// Logits of the last eval: `n_vocab` values, or one row per evaluated
    /// token with `logits_all`.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Final hidden state of the last evaluated token; empty unless the
    /// context was created in embedding mode.
    pub fn embeddings(&self) -> &[f32] {
        &self.embeddings
    }

    pub fn token_to_str(&self, token: TokenId) -> Option<Cow<'_, str>> {
        self.model.vocab().token_to_str(token)
    }

    pub fn token_bytes(&self, token: TokenId) -> Option<&[u8]> {
        self.model.vocab().token_bytes(token)
    }

    pub fn n_vocab(&self) -> usize {
        self.model.hparams().n_vocab
    }

    pub fn n_ctx(&self) -> usize {
        self.params.n_ctx()
    }

    pub fn n_embd(&self) -> usize {
        self.model.hparams().n_embd
    }

    /// Number of committed positions.
    pub fn n_past(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.kv.n_past())
    }

    /// Positions held by the KV cache (per layer).
    pub fn kv_positions(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.kv.positions())
    }

    pub fn kv_memory_bytes(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.kv.memory_bytes())
    }

    /// Forget every evaluated position and zero the output buffers. The RNG
    /// and the timings carry on.
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.kv.clear();
        }
        let n_vocab = self.n_vocab();
        self.logits.truncate(n_vocab);
        self.logits.fill(0.0);
        self.embeddings.fill(0.0);
    }

    /// Sample from the last logits row with the context RNG.
    pub fn sample(&mut self, recent: &[TokenId], params: &SamplingParams) -> Result<TokenId> {
        let start = Instant::now();
        let n_vocab = self.n_vocab();
        let row = &self.logits[self.logits.len().saturating_sub(n_vocab)..];
        let token = llama_sampling::sample(row, recent, params, &mut self.rng)?;
        self.timings.record_sample(start.elapsed());
        Ok(token)
    }

    pub fn sample_top_p_top_k(
        &mut self,
        recent: &[TokenId],
        top_k: i32,
        top_p: f32,
        temperature: f32,
        repeat_penalty: f32,
    ) -> Result<TokenId> {
        let params = SamplingParams {
            top_k,
            top_p,
            temperature,
            repeat_penalty,
        };
        self.sample(recent, &params)
    }

    pub fn timings(&self) -> TimingReport {
        self.timings.report()
    }

    /// Log the timing report at info level.
    pub fn print_timings(&self) {
        let report = self.timings.report();
        for line in report.to_string().lines() {
            tracing::info!(ctx = %self.id, "{line}");
        }
    }

    pub fn reset_timings(&mut self) {
        self.timings.reset();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        tracing::debug!(ctx = %self.id, n_past = self.n_past(), "context closed");
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_models::fixture::{self, FixtureConfig};

    fn tiny_context(params: ContextParams) -> (tempfile::TempDir, Context) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        fixture::write_model(&path, &FixtureConfig::tiny()).unwrap();
        let ctx = Context::init(&path, params).unwrap();
        (dir, ctx)
    }

    #[test]
    fn pool_is_rebuilt_only_on_thread_change() {
        let (_dir, mut ctx) = tiny_context(ContextParams::builder().n_ctx(8).seed(1).build().unwrap());
        assert!(ctx.pool.is_none());
        ctx.eval(&[1], 0, 2).unwrap();
        assert_eq!(ctx.pool.as_ref().map(WorkerPool::n_threads), Some(2));
        ctx.eval(&[3], 1, 2).unwrap();
        assert_eq!(ctx.pool.as_ref().map(WorkerPool::n_threads), Some(2));
        ctx.eval(&[4], 2, 1).unwrap();
        assert_eq!(ctx.pool.as_ref().map(WorkerPool::n_threads), Some(1));
    }

    #[test]
    fn reset_clears_positions() {
        let (_dir, mut ctx) = tiny_context(ContextParams::builder().n_ctx(8).seed(1).build().unwrap());
        ctx.eval(&[1, 5, 6], 0, 1).unwrap();
        assert_eq!(ctx.n_past(), 3);
        ctx.reset();
        assert_eq!(ctx.n_past(), 0);
        assert_eq!(ctx.kv_positions(), 0);
        assert!(ctx.logits().iter().all(|&l| l == 0.0));
    }

    #[test]
    fn timings_count_evals_and_samples() {
        let (_dir, mut ctx) = tiny_context(ContextParams::builder().n_ctx(8).seed(1).build().unwrap());
        ctx.eval(&[1, 5], 0, 1).unwrap();
        ctx.sample_top_p_top_k(&[], 40, 0.95, 0.8, 1.1).unwrap();
        let report = ctx.timings();
        assert_eq!(report.eval_tokens, 2);
        assert_eq!(report.sample_count, 1);
        assert!(report.load_ms > 0.0);
        ctx.reset_timings();
        assert_eq!(ctx.timings().eval_tokens, 0);
        ctx.print_timings();
    }
}
