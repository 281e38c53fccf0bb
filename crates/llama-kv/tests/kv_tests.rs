//! Integration tests for llama-kv.
//!
//! Validates:
//! - Batch vs incremental equivalence (same rows at the same positions give
//!   the same attention reads, however they were written)
//! - Commit/rewind semantics across layers
//! - Precision behaviour (f16 vs f32 storage)
//! - Capacity management and boundary conditions
//! - Memory accounting correctness
//! - Error paths and their mapping onto engine errors

use llama_engine::{KvPrecision, LlamaError};
use llama_kv::*;

fn rows(n_pos: usize, row_len: usize, scale: f32) -> Vec<Vec<f32>> {
    (0..n_pos)
        .map(|p| {
            (0..row_len)
                .map(|i| ((p * row_len + i) as f32 * scale).sin())
                .collect()
        })
        .collect()
}

// ===========================================================================
// Batch vs incremental equivalence
// ===========================================================================

#[test]
fn batch_write_equals_incremental_write() {
    let shape = KVShape::new(16, 4, 8);
    let ks = rows(5, shape.row_len(), 0.1);
    let vs = rows(5, shape.row_len(), 0.2);

    // One batch: five positions, committed once.
    let mut batch = SessionKVCache::new(2, shape, KvPrecision::F32).unwrap();
    for layer in 0..2 {
        for pos in 0..5 {
            batch.store(layer, pos, &ks[pos], &vs[pos]).unwrap();
        }
    }
    batch.commit(5).unwrap();

    // Five single-position evaluations.
    let mut step = SessionKVCache::new(2, shape, KvPrecision::F32).unwrap();
    for pos in 0..5 {
        for layer in 0..2 {
            step.store(layer, pos, &ks[pos], &vs[pos]).unwrap();
        }
        step.commit(pos + 1).unwrap();
    }

    assert_eq!(batch.n_past(), step.n_past());
    let q = vec![0.5; shape.head_dim];
    for layer in 0..2 {
        for pos in 0..5 {
            for head in 0..shape.n_heads {
                let a = batch.dot_key(layer, pos, head, &q).unwrap();
                let b = step.dot_key(layer, pos, head, &q).unwrap();
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }
}

#[test]
fn rewind_then_rewrite_replaces_positions() {
    let shape = KVShape::new(8, 1, 2);
    let mut cache = SessionKVCache::new(1, shape, KvPrecision::F32).unwrap();
    cache.store(0, 0, &[1.0, 0.0], &[1.0, 0.0]).unwrap();
    cache.store(0, 1, &[2.0, 0.0], &[2.0, 0.0]).unwrap();
    cache.commit(2).unwrap();

    cache.truncate(1).unwrap();
    cache.store(0, 1, &[9.0, 0.0], &[9.0, 0.0]).unwrap();
    cache.commit(2).unwrap();

    assert_eq!(cache.dot_key(0, 0, 0, &[1.0, 1.0]).unwrap(), 1.0);
    assert_eq!(cache.dot_key(0, 1, 0, &[1.0, 1.0]).unwrap(), 9.0);
}

#[test]
fn uncommitted_rows_are_readable_for_attention() {
    let shape = KVShape::new(4, 1, 2);
    let mut cache = SessionKVCache::new(1, shape, KvPrecision::F32).unwrap();
    cache.store(0, 0, &[3.0, 4.0], &[1.0, 2.0]).unwrap();
    assert_eq!(cache.n_past(), 0);

    assert_eq!(cache.dot_key(0, 0, 0, &[1.0, 1.0]).unwrap(), 7.0);
    let mut out = [0.0; 2];
    cache.accumulate_value(0, 0, 0, 2.0, &mut out).unwrap();
    assert_eq!(out, [2.0, 4.0]);
}

// ===========================================================================
// Precision
// ===========================================================================

#[test]
fn f16_and_f32_agree_within_half_precision() {
    let shape = KVShape::new(4, 2, 4);
    let ks = rows(4, shape.row_len(), 0.37);
    let q = [0.25, -0.5, 0.75, 1.0];

    let mut half = SessionKVCache::new(1, shape, KvPrecision::F16).unwrap();
    let mut full = SessionKVCache::new(1, shape, KvPrecision::F32).unwrap();
    for (pos, k) in ks.iter().enumerate() {
        half.store(0, pos, k, k).unwrap();
        full.store(0, pos, k, k).unwrap();
    }
    for pos in 0..4 {
        for head in 0..2 {
            let a = half.dot_key(0, pos, head, &q).unwrap();
            let b = full.dot_key(0, pos, head, &q).unwrap();
            assert!((a - b).abs() < 5e-3, "pos {pos} head {head}: {a} vs {b}");
        }
    }
    assert_eq!(half.memory_bytes() * 2, full.memory_bytes());
    assert_eq!(half.precision(), KvPrecision::F16);
}

// ===========================================================================
// Capacity
// ===========================================================================

#[test]
fn fill_to_exact_capacity() {
    let shape = KVShape::new(3, 1, 2);
    let mut cache = SessionKVCache::new(1, shape, KvPrecision::F32).unwrap();
    for pos in 0..3 {
        cache.store(0, pos, &[0.0; 2], &[0.0; 2]).unwrap();
    }
    cache.commit(3).unwrap();
    assert_eq!(cache.positions(), cache.capacity());
}

#[test]
fn exceed_capacity_by_one() {
    let shape = KVShape::new(3, 1, 2);
    let mut cache = SessionKVCache::new(1, shape, KvPrecision::F32).unwrap();
    let err = cache.store(0, 3, &[0.0; 2], &[0.0; 2]).unwrap_err();
    assert_eq!(err, KVError::CapacityExceeded { pos: 3, max: 3 });
    assert!(cache.commit(4).is_err());
    assert_eq!(cache.n_past(), 0);
}

// ===========================================================================
// Memory accounting
// ===========================================================================

#[test]
fn memory_bytes_does_not_change_with_positions() {
    let shape = KVShape::new(10, 2, 4);
    let mut cache = SessionKVCache::new(2, shape, KvPrecision::F16).unwrap();
    let before = cache.memory_bytes();
    assert_eq!(before, 2 * shape.capacity_bytes(2) * 2);
    cache.commit(5).unwrap();
    assert_eq!(cache.memory_bytes(), before);
}

#[test]
fn active_memory_tracks_commit_and_clear() {
    let shape = KVShape::new(10, 2, 4);
    let mut cache = SessionKVCache::new(2, shape, KvPrecision::F32).unwrap();
    cache.commit(3).unwrap();
    assert_eq!(cache.active_memory_bytes(), 2 * 3 * 8 * 2 * 4);
    cache.clear();
    assert_eq!(cache.active_memory_bytes(), 0);
    assert_eq!(cache.positions(), 0);
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn error_display_is_descriptive() {
    let err = KVError::Committed { pos: 1, n_past: 4 };
    assert!(err.to_string().contains("n_past=4"));
    let err = KVError::CapacityExceeded { pos: 9, max: 8 };
    assert!(err.to_string().contains('9'));
}

#[test]
fn error_is_std_error() {
    let err: Box<dyn std::error::Error> = Box::new(KVError::ShapeMismatch {
        expected: 4,
        got: 3,
    });
    assert!(err.to_string().contains("expected 4"));
}

#[test]
fn capacity_error_becomes_context_overflow() {
    let mut cache = SessionKVCache::new(1, KVShape::new(2, 1, 2), KvPrecision::F32).unwrap();
    let err: LlamaError = cache.store(0, 2, &[0.0; 2], &[0.0; 2]).unwrap_err().into();
    assert!(matches!(
        err,
        LlamaError::ContextOverflow {
            n_past: 2,
            n_ctx: 2,
            ..
        }
    ));
}

#[test]
fn layer_accessor_exposes_shape() {
    let shape = KVShape::new(6, 3, 2);
    let cache = SessionKVCache::new(4, shape, KvPrecision::F32).unwrap();
    assert_eq!(cache.n_layers(), 4);
    assert_eq!(cache.layer(3).unwrap().shape(), shape);
    assert_eq!(cache.shape(), shape);
}
