//! Integration tests for llama-sampling.
//!
//! Validates:
//! - Greedy selection (temperature <= 0, top_k = 1) regardless of seed
//! - Temperature scaling effects on the drawn distribution
//! - Top-k and top-p (nucleus) filtering correctness
//! - Repetition penalty mathematics
//! - Determinism (seeded RNG reproducibility)
//! - Parameter defaults and deserialization
//! - Error paths

use llama_engine::{LlamaError, TokenId};
use llama_sampling::*;

fn params(top_k: i32, top_p: f32, temperature: f32, repeat_penalty: f32) -> SamplingParams {
    SamplingParams {
        top_k,
        top_p,
        temperature,
        repeat_penalty,
    }
}

/// Draw `n` tokens and count how often each id comes up.
fn histogram(logits: &[f32], p: &SamplingParams, seed: u64, n: usize) -> Vec<usize> {
    let mut rng = SeededRng::new(seed);
    let mut counts = vec![0; logits.len()];
    for _ in 0..n {
        let id = sample(logits, &[], p, &mut rng).unwrap();
        counts[id as usize] += 1;
    }
    counts
}

// ===========================================================================
// Greedy selection
// ===========================================================================

#[test]
fn zero_temperature_is_argmax_for_any_seed() {
    let logits = vec![0.3, 2.5, -1.0, 2.4, 0.0];
    for seed in 0..50 {
        let mut rng = SeededRng::new(seed);
        assert_eq!(sample(&logits, &[], &params(40, 0.95, 0.0, 1.0), &mut rng), Ok(1));
        assert_eq!(sample(&logits, &[], &params(40, 0.95, -2.0, 1.0), &mut rng), Ok(1));
    }
}

#[test]
fn top_k_equals_1_is_greedy_for_any_seed() {
    let logits = vec![1.0, 5.0, 2.0, 3.0];
    for seed in 0..50 {
        let mut rng = SeededRng::new(seed);
        for _ in 0..5 {
            assert_eq!(sample(&logits, &[], &params(1, 1.0, 1.5, 1.0), &mut rng), Ok(1));
        }
    }
}

#[test]
fn greedy_ties_resolve_to_lowest_id() {
    let logits = vec![0.0, 4.0, 4.0, 4.0];
    let mut rng = SeededRng::new(5);
    assert_eq!(sample(&logits, &[], &params(40, 0.95, 0.0, 1.0), &mut rng), Ok(1));
    assert_eq!(sample(&logits, &[], &params(1, 1.0, 1.0, 1.0), &mut rng), Ok(1));
}

// ===========================================================================
// Temperature
// ===========================================================================

#[test]
fn low_temperature_concentrates_draws() {
    let logits = vec![1.0, 2.0, 1.5, 0.5];
    let cold = histogram(&logits, &params(0, 1.0, 0.1, 1.0), 7, 2000);
    let hot = histogram(&logits, &params(0, 1.0, 5.0, 1.0), 7, 2000);
    assert!(cold[1] > 1900, "cold draws: {cold:?}");
    assert!(hot[1] < 1000, "hot draws: {hot:?}");
    assert!(hot.iter().all(|&c| c > 0), "hot draws: {hot:?}");
}

#[test]
fn vanishing_temperature_is_greedy() {
    let logits = vec![1.0, 5.0, 3.0];
    for seed in 0..20 {
        let mut rng = SeededRng::new(seed);
        assert_eq!(sample(&logits, &[], &params(40, 0.95, 1e-38, 1.0), &mut rng), Ok(1));
        assert_eq!(sample(&logits, &[], &params(0, 1.0, f32::MIN_POSITIVE, 1.0), &mut rng), Ok(1));
    }
    let mut rng = SeededRng::new(3);
    let negative = vec![-4.0, -1.0, -2.0];
    assert_eq!(sample(&negative, &[], &params(0, 1.0, 1e-38, 1.0), &mut rng), Ok(1));
}

#[test]
fn temperature_one_follows_softmax() {
    // softmax([ln 1, ln 3]) = [0.25, 0.75]
    let logits = vec![0.0, 3.0f32.ln()];
    let counts = histogram(&logits, &params(0, 1.0, 1.0, 1.0), 11, 10_000);
    let share = counts[1] as f32 / 10_000.0;
    assert!((share - 0.75).abs() < 0.03, "share of id 1: {share}");
}

// ===========================================================================
// Top-k / top-p
// ===========================================================================

#[test]
fn top_k_restricts_to_k_tokens() {
    let logits = vec![1.0, 10.0, 2.0, 0.5, 9.5];
    let counts = histogram(&logits, &params(2, 1.0, 4.0, 1.0), 3, 500);
    assert_eq!(counts[0] + counts[2] + counts[3], 0, "{counts:?}");
    assert!(counts[1] > 0 && counts[4] > 0, "{counts:?}");
}

#[test]
fn top_k_larger_than_vocab_or_zero_has_no_effect() {
    let logits = vec![0.0, 0.1, 0.2];
    for k in [0, -1, 100] {
        let counts = histogram(&logits, &params(k, 1.0, 1.0, 1.0), 13, 900);
        assert!(counts.iter().all(|&c| c > 200), "k={k}: {counts:?}");
    }
}

#[test]
fn top_p_filters_low_probability_tail() {
    // probabilities 0.5, 0.3, 0.15, 0.05
    let logits: Vec<f32> = [0.5f32, 0.3, 0.15, 0.05].iter().map(|p| p.ln()).collect();
    let counts = histogram(&logits, &params(0, 0.75, 1.0, 1.0), 17, 1000);
    assert!(counts[0] > 0 && counts[1] > 0);
    assert_eq!(counts[2] + counts[3], 0, "{counts:?}");
}

#[test]
fn top_p_very_small_is_greedy() {
    let logits = vec![0.2, 0.9, 0.4];
    let counts = histogram(&logits, &params(0, 1e-6, 1.0, 1.0), 19, 200);
    assert_eq!(counts, vec![0, 200, 0]);
}

#[test]
fn top_p_one_includes_all_tokens() {
    let logits = vec![0.0, 0.0, 0.0, 0.0];
    let counts = histogram(&logits, &params(0, 1.0, 1.0, 1.0), 23, 800);
    assert!(counts.iter().all(|&c| c > 100), "{counts:?}");
}

// ===========================================================================
// Repetition penalty
// ===========================================================================

#[test]
fn repetition_penalty_can_flip_the_argmax() {
    let logits = vec![2.0, 1.9];
    let mut rng = SeededRng::new(1);
    let greedy = params(40, 0.95, 0.0, 1.5);
    assert_eq!(sample(&logits, &[], &greedy, &mut rng), Ok(0));
    assert_eq!(sample(&logits, &[0], &greedy, &mut rng), Ok(1));
}

#[test]
fn repetition_penalty_pushes_negative_logits_down() {
    let logits = vec![-1.0, -1.2];
    let mut rng = SeededRng::new(1);
    let greedy = params(40, 0.95, 0.0, 2.0);
    // -1.0 * 2 = -2.0 < -1.2
    assert_eq!(sample(&logits, &[0], &greedy, &mut rng), Ok(1));
}

#[test]
fn repeated_history_entries_count_once() {
    let logits = vec![3.0, 2.0];
    let mut rng = SeededRng::new(1);
    let greedy = params(40, 0.95, 0.0, 1.4);
    // once: 3.0 / 1.4 > 2.0; applied three times it would not be
    assert_eq!(sample(&logits, &[0, 0, 0], &greedy, &mut rng), Ok(0));
}

#[test]
fn repetition_penalty_out_of_range_history_ignored() {
    let logits = vec![1.0, 2.0];
    let mut rng = SeededRng::new(1);
    let greedy = params(40, 0.95, 0.0, 10.0);
    assert_eq!(sample(&logits, &[-1, 2, 99], &greedy, &mut rng), Ok(1));
}

// ===========================================================================
// Determinism and Reproducibility
// ===========================================================================

#[test]
fn same_seed_same_sequence_1000_samples() {
    let logits = vec![0.1, 0.2, 0.3, 0.15, 0.25];
    let p = SamplingParams::default();
    let mut r1 = SeededRng::new(12345);
    let mut r2 = SeededRng::new(12345);

    for i in 0..1000 {
        let t1 = sample(&logits, &[], &p, &mut r1).unwrap();
        let t2 = sample(&logits, &[], &p, &mut r2).unwrap();
        assert_eq!(t1, t2, "mismatch at step {}", i);
    }
}

#[test]
fn different_seeds_different_sequences() {
    let logits = vec![0.25, 0.25, 0.25, 0.25];

    let mut s1 = Sampler::new().with_seed(1);
    let mut s2 = Sampler::new().with_seed(2);

    let seq1: Vec<TokenId> = (0..100).map(|_| s1.sample(&logits).unwrap()).collect();
    let seq2: Vec<TokenId> = (0..100).map(|_| s2.sample(&logits).unwrap()).collect();

    assert_ne!(
        seq1, seq2,
        "different seeds should produce different sequences"
    );
}

#[test]
fn determinism_with_combined_strategies() {
    let logits = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    let history = [4, 3];

    let make_sampler = || {
        Sampler::new()
            .with_temperature(0.7)
            .with_top_k(3)
            .with_top_p(0.9)
            .with_repetition_penalty(1.3)
            .with_seed(42)
    };

    let mut s1 = make_sampler();
    let mut s2 = make_sampler();

    for _ in 0..100 {
        assert_eq!(
            s1.sample_with_history(&logits, &history).unwrap(),
            s2.sample_with_history(&logits, &history).unwrap()
        );
    }
}

#[test]
fn seeded_rng_zero_seed_not_stuck() {
    let mut rng = SeededRng::new(0);
    let values: Vec<f32> = (0..10).map(|_| rng.next_f32()).collect();
    assert!(values.windows(2).any(|w| w[0] != w[1]));
}

#[test]
fn sample_always_returns_valid_index() {
    let logits: Vec<f32> = (0..1000).map(|i| ((i * 37) % 101) as f32 * 0.05).collect();
    let mut sampler = Sampler::new().with_seed(99);
    for _ in 0..200 {
        let id = sampler.sample(&logits).unwrap();
        assert!((0..1000).contains(&id));
    }
}

#[test]
fn negative_infinity_logits_are_never_drawn() {
    let mut logits = vec![f32::NEG_INFINITY; 8];
    logits[5] = 0.0;
    let counts = histogram(&logits, &params(0, 1.0, 1.0, 1.0), 29, 100);
    assert_eq!(counts[5], 100);
}

// ===========================================================================
// Parameters
// ===========================================================================

#[test]
fn default_parameters() {
    let p = SamplingParams::default();
    assert_eq!(p.top_k, 40);
    assert_eq!(p.top_p, 0.95);
    assert_eq!(p.temperature, 0.8);
    assert_eq!(p.repeat_penalty, 1.1);
    assert_eq!(Sampler::default().params(), &p);
}

#[test]
fn params_deserialize_with_defaults() {
    let p: SamplingParams = serde_json::from_str(r#"{"top_k": 1, "temperature": 0.0}"#).unwrap();
    assert_eq!(p.top_k, 1);
    assert_eq!(p.temperature, 0.0);
    assert_eq!(p.top_p, 0.95);
    assert_eq!(p.repeat_penalty, 1.1);

    let empty: SamplingParams = serde_json::from_str("{}").unwrap();
    assert_eq!(empty, SamplingParams::default());
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn empty_logits_error() {
    let mut sampler = Sampler::new();
    assert_eq!(sampler.sample(&[]), Err(SamplingError::InvalidLogits));
}

#[test]
fn nan_logits_error() {
    let mut sampler = Sampler::new();
    assert_eq!(
        sampler.sample(&[0.0, f32::NAN]),
        Err(SamplingError::InvalidLogits)
    );
}

#[test]
fn non_positive_penalty_error() {
    for penalty in [0.0, -1.0, f32::NAN] {
        let mut sampler = Sampler::new().with_repetition_penalty(penalty);
        assert_eq!(sampler.sample(&[1.0]), Err(SamplingError::InvalidPenalty));
    }
}

#[test]
fn sampling_error_display_and_conversion() {
    assert_eq!(SamplingError::InvalidLogits.to_string(), "Invalid logits array");
    let err: LlamaError = SamplingError::InvalidPenalty.into();
    assert!(matches!(err, LlamaError::InvalidArgument(_)));
    let boxed: Box<dyn std::error::Error> = Box::new(SamplingError::NoValidTokens);
    assert!(boxed.to_string().contains("No valid tokens"));
}
