//! # llama-sampling
//!
//! Next-token selection for llama.rs.
//!
//! Every draw runs the same fixed pipeline:
//! 1. Repeat penalty over the distinct recently emitted tokens
//! 2. Temperature (`<= 0` short-circuits to greedy argmax)
//! 3. Numerically stable softmax
//! 4. Top-k over candidates sorted by probability, ties broken by lower id
//! 5. Top-p (nucleus) cut
//! 6. Renormalised draw from a deterministic seeded RNG

use serde::Deserialize;

use llama_engine::{LlamaError, TokenId};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    /// Empty logits, or logits containing NaN.
    #[error("Invalid logits array")]
    InvalidLogits,
    /// Repeat penalty is zero, negative or NaN.
    #[error("Repeat penalty must be > 0")]
    InvalidPenalty,
    /// Nothing left to draw from (every logit is negative infinity).
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

impl From<SamplingError> for LlamaError {
    fn from(e: SamplingError) -> Self {
        LlamaError::InvalidArgument(e.to_string())
    }
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Knobs of the sampling pipeline.
///
/// Deserializes from partial documents; missing fields take the defaults
/// `top_k = 40`, `top_p = 0.95`, `temperature = 0.8`, `repeat_penalty = 1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Keep the `top_k` most probable tokens; `<= 0` keeps all.
    pub top_k: i32,
    /// Keep the smallest prefix whose probability mass reaches `top_p`;
    /// `>= 1.0` disables the cut.
    pub top_p: f32,
    /// Softmax temperature; `<= 0` selects the argmax.
    pub temperature: f32,
    /// Divisor for positive (multiplier for non-positive) logits of
    /// recently emitted tokens.
    pub repeat_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repeat_penalty: 1.1,
        }
    }
}

/// Draw one token id from `logits`.
///
/// `recent` holds previously emitted tokens that the repeat penalty applies
/// to; ids outside the logits range are ignored. With `temperature <= 0`
/// the RNG is left untouched.
pub fn sample(
    logits: &[f32],
    recent: &[TokenId],
    params: &SamplingParams,
    rng: &mut SeededRng,
) -> SamplingResult<TokenId> {
    if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
        return Err(SamplingError::InvalidLogits);
    }
    if params.repeat_penalty.is_nan() || params.repeat_penalty <= 0.0 {
        return Err(SamplingError::InvalidPenalty);
    }

    let mut work = logits.to_vec();
    apply_repeat_penalty(&mut work, recent, params.repeat_penalty);

    if params.temperature <= 0.0 {
        return Ok(argmax(&work));
    }
    for logit in &mut work {
        *logit /= params.temperature;
    }
    // A vanishing temperature overflows the leader; that limit is greedy.
    if work.iter().any(|l| *l == f32::INFINITY) {
        return Ok(argmax(&work));
    }

    let probs = softmax(&work).ok_or(SamplingError::NoValidTokens)?;

    let mut candidates: Vec<(TokenId, f32)> = probs
        .into_iter()
        .enumerate()
        .map(|(id, p)| (id as TokenId, p))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    if params.top_k > 0 {
        candidates.truncate(params.top_k as usize);
    }
    if params.top_p < 1.0 {
        let mut cumsum = 0.0;
        let mut keep = candidates.len();
        for (idx, (_, p)) in candidates.iter().enumerate() {
            cumsum += p;
            if cumsum >= params.top_p {
                keep = idx + 1;
                break;
            }
        }
        candidates.truncate(keep);
    }

    let total: f32 = candidates.iter().map(|(_, p)| p).sum();
    let r = rng.next_f32() * total;
    let mut cumsum = 0.0;
    for &(id, p) in &candidates {
        cumsum += p;
        if r < cumsum {
            return Ok(id);
        }
    }

    // Rounding left `r` just past the last boundary.
    candidates
        .iter()
        .rev()
        .find(|(_, p)| *p > 0.0)
        .map(|&(id, _)| id)
        .ok_or(SamplingError::NoValidTokens)
}

/// Penalise each distinct in-range id of `recent` once.
fn apply_repeat_penalty(logits: &mut [f32], recent: &[TokenId], penalty: f32) {
    let mut ids: Vec<usize> = recent
        .iter()
        .filter_map(|&id| usize::try_from(id).ok())
        .filter(|&id| id < logits.len())
        .collect();
    ids.sort_unstable();
    ids.dedup();

    for id in ids {
        let logit = &mut logits[id];
        if *logit > 0.0 {
            *logit /= penalty;
        } else {
            *logit *= penalty;
        }
    }
}

/// Index of the largest logit; the lowest id wins ties.
fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as TokenId
}

/// Max-subtracted softmax; `None` when every logit is negative infinity.
fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return None;
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    Some(exps.iter().map(|&e| e / sum).collect())
}

/// Sampling configuration bundled with its own RNG.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,

    /// RNG state for reproducible sampling. Mutated on each call.
    rng: SeededRng,
}

impl Sampler {
    /// Create a sampler with default parameters and seed 42.
    pub fn new() -> Self {
        Self::from_params(SamplingParams::default())
    }

    pub fn from_params(params: SamplingParams) -> Self {
        Self {
            params,
            rng: SeededRng::new(42),
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.params.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: i32) -> Self {
        self.params.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.params.top_p = p;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.params.repeat_penalty = penalty;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Sample a token id from logits, without repeat penalty history.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<TokenId> {
        sample(logits, &[], &self.params, &mut self.rng)
    }

    /// Sample with history for repetition penalty.
    pub fn sample_with_history(
        &mut self,
        logits: &[f32],
        history: &[TokenId],
    ) -> SamplingResult<TokenId> {
        sample(logits, history, &self.params, &mut self.rng)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_reproducible() {
        let mut rng1 = SeededRng::new(42);
        let mut rng2 = SeededRng::new(42);

        for _ in 0..100 {
            let v1 = rng1.next_f32();
            let v2 = rng2.next_f32();
            assert_eq!(v1, v2);
            assert!((0.0..1.0).contains(&v1));
        }
    }

    #[test]
    fn argmax_prefers_lowest_id_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[f32::NEG_INFINITY, f32::NEG_INFINITY]), 0);
    }

    #[test]
    fn softmax_uniform() {
        let probs = softmax(&[1.0, 1.0, 1.0]).unwrap();
        assert!((probs[0] - 1.0 / 3.0).abs() < 1e-5);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(softmax(&[f32::NEG_INFINITY]).is_none());
    }

    #[test]
    fn penalty_applies_once_per_distinct_id() {
        let mut logits = vec![2.0, -2.0, 1.0];
        apply_repeat_penalty(&mut logits, &[0, 0, 0, 1, 7, -3], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 1.0]);
    }

    #[test]
    fn greedy_leaves_rng_untouched() {
        let params = SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        };
        let mut rng = SeededRng::new(9);
        assert_eq!(sample(&[0.5, 2.0, 1.0], &[], &params, &mut rng), Ok(1));

        let mut fresh = SeededRng::new(9);
        assert_eq!(rng.next_f32(), fresh.next_f32());
    }

    #[test]
    fn top_p_keeps_shortest_prefix() {
        // probabilities roughly 0.64 / 0.24 / 0.09 / 0.03
        let logits = [3.0, 2.0, 1.0, 0.0];
        let params = SamplingParams {
            top_k: 0,
            top_p: 0.5,
            temperature: 1.0,
            repeat_penalty: 1.0,
        };
        let mut rng = SeededRng::new(3);
        for _ in 0..50 {
            assert_eq!(sample(&logits, &[], &params, &mut rng), Ok(0));
        }
    }

    #[test]
    fn invalid_inputs() {
        let mut rng = SeededRng::new(1);
        let p = SamplingParams::default();
        assert_eq!(sample(&[], &[], &p, &mut rng), Err(SamplingError::InvalidLogits));
        assert_eq!(
            sample(&[1.0, f32::NAN], &[], &p, &mut rng),
            Err(SamplingError::InvalidLogits)
        );
        let bad = SamplingParams {
            repeat_penalty: 0.0,
            ..p
        };
        assert_eq!(
            sample(&[1.0], &[], &bad, &mut rng),
            Err(SamplingError::InvalidPenalty)
        );
        assert_eq!(
            sample(&[f32::NEG_INFINITY; 3], &[], &p, &mut rng),
            Err(SamplingError::NoValidTokens)
        );
    }
}
