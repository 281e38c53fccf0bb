//! # llama-kv
//!
//! Incremental key/value cache for llama.rs.
//!
//! Supports:
//! - **Positional writes**: K/V rows are stored at absolute positions, so a
//!   batch of tokens lands at `n_past..n_past + n_tokens`
//! - **Commit/rewind**: positions become part of the context only when the
//!   evaluation that wrote them commits; `truncate()` rewinds
//! - **Precision**: rows are stored as f16 or f32 (chosen at creation);
//!   attention always reads them back as f32
//! - **Memory tracking**: byte accounting for both allocated and active memory
//! - **Type safety**: KVShape enforces valid dimensions

use std::fmt;

use half::f16;

use llama_engine::{KvPrecision, LlamaError};

/// Per-layer cache geometry: `[n_ctx, n_heads, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub n_ctx: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(n_ctx: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            n_ctx,
            n_heads,
            head_dim,
        }
    }

    /// Width of one position's row (`n_heads * head_dim`, i.e. `n_embd`).
    pub fn row_len(&self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn total_elements(&self) -> usize {
        self.n_ctx * self.row_len()
    }

    pub fn capacity_bytes(&self, bytes_per_element: usize) -> usize {
        self.total_elements() * bytes_per_element
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ctx:{}, heads:{}, dim:{}]",
            self.n_ctx, self.n_heads, self.head_dim
        )
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: position {pos} >= {max}")]
    CapacityExceeded { pos: usize, max: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Position {pos} is committed (n_past={n_past}); truncate() first")]
    Committed { pos: usize, n_past: usize },

    #[error("Layer {layer} out of range ({n_layers} layers)")]
    LayerOutOfRange { layer: usize, n_layers: usize },

    #[error("Cannot rewind forward: {requested} > n_past {n_past}")]
    InvalidTruncate { requested: usize, n_past: usize },

    #[error("KV cache allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },
}

pub type KVResult<T> = Result<T, KVError>;

impl From<KVError> for LlamaError {
    fn from(e: KVError) -> Self {
        match e {
            KVError::CapacityExceeded { pos, max } => LlamaError::ContextOverflow {
                n_past: pos,
                n_tokens: 1,
                n_ctx: max,
            },
            KVError::Allocation { .. } => LlamaError::Allocation(e.to_string()),
            other => LlamaError::InvalidArgument(other.to_string()),
        }
    }
}

/// Backing storage for one K or V buffer.
#[derive(Debug, Clone)]
enum KVBuffer {
    F16(Vec<f16>),
    F32(Vec<f32>),
}

impl KVBuffer {
    fn zeroed(precision: KvPrecision, len: usize) -> KVResult<Self> {
        let bytes = len * precision.bytes_per_element();
        match precision {
            KvPrecision::F16 => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(len)
                    .map_err(|_| KVError::Allocation { bytes })?;
                buf.resize(len, f16::ZERO);
                Ok(KVBuffer::F16(buf))
            }
            KvPrecision::F32 => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(len)
                    .map_err(|_| KVError::Allocation { bytes })?;
                buf.resize(len, 0.0);
                Ok(KVBuffer::F32(buf))
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            KVBuffer::F16(b) => b.len(),
            KVBuffer::F32(b) => b.len(),
        }
    }

    fn write(&mut self, offset: usize, src: &[f32]) {
        match self {
            KVBuffer::F16(b) => {
                for (dst, &v) in b[offset..offset + src.len()].iter_mut().zip(src) {
                    *dst = f16::from_f32(v);
                }
            }
            KVBuffer::F32(b) => b[offset..offset + src.len()].copy_from_slice(src),
        }
    }

    fn dot(&self, offset: usize, q: &[f32]) -> f32 {
        match self {
            KVBuffer::F16(b) => b[offset..offset + q.len()]
                .iter()
                .zip(q)
                .fold(0.0, |acc, (k, &q)| acc + k.to_f32() * q),
            KVBuffer::F32(b) => b[offset..offset + q.len()]
                .iter()
                .zip(q)
                .fold(0.0, |acc, (&k, &q)| acc + k * q),
        }
    }

    fn axpy(&self, offset: usize, weight: f32, out: &mut [f32]) {
        let end = offset + out.len();
        match self {
            KVBuffer::F16(b) => {
                for (o, v) in out.iter_mut().zip(&b[offset..end]) {
                    *o += weight * v.to_f32();
                }
            }
            KVBuffer::F32(b) => {
                for (o, &v) in out.iter_mut().zip(&b[offset..end]) {
                    *o += weight * v;
                }
            }
        }
    }

    fn read(&self, offset: usize, out: &mut [f32]) {
        let end = offset + out.len();
        match self {
            KVBuffer::F16(b) => {
                for (o, v) in out.iter_mut().zip(&b[offset..end]) {
                    *o = v.to_f32();
                }
            }
            KVBuffer::F32(b) => out.copy_from_slice(&b[offset..end]),
        }
    }
}

/// Single transformer layer's K and V cache.
///
/// # Invariants
/// - K and V buffers both hold `shape.n_ctx * shape.row_len()` elements
/// - the row of position `p` starts at `p * shape.row_len()`
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    k: KVBuffer,
    v: KVBuffer,
    shape: KVShape,
}

impl LayerKVCache {
    /// Allocate a zeroed cache for one layer.
    ///
    /// # Errors
    /// - `Allocation`: if either buffer cannot be reserved
    pub fn new(shape: KVShape, precision: KvPrecision) -> KVResult<Self> {
        Ok(Self {
            k: KVBuffer::zeroed(precision, shape.total_elements())?,
            v: KVBuffer::zeroed(precision, shape.total_elements())?,
            shape,
        })
    }

    pub fn shape(&self) -> KVShape {
        self.shape
    }

    fn check_pos(&self, pos: usize) -> KVResult<()> {
        if pos >= self.shape.n_ctx {
            return Err(KVError::CapacityExceeded {
                pos,
                max: self.shape.n_ctx,
            });
        }
        Ok(())
    }

    fn check_len(&self, expected: usize, got: usize) -> KVResult<()> {
        if expected != got {
            return Err(KVError::ShapeMismatch { expected, got });
        }
        Ok(())
    }

    /// Store the K and V rows (`[n_heads * head_dim]` each) of position `pos`.
    ///
    /// # Errors
    /// - `CapacityExceeded`: if `pos >= n_ctx`
    /// - `ShapeMismatch`: if a row length differs from `n_heads * head_dim`
    pub fn store(&mut self, pos: usize, k_row: &[f32], v_row: &[f32]) -> KVResult<()> {
        self.check_pos(pos)?;
        self.check_len(self.shape.row_len(), k_row.len())?;
        self.check_len(self.shape.row_len(), v_row.len())?;

        let offset = pos * self.shape.row_len();
        self.k.write(offset, k_row);
        self.v.write(offset, v_row);
        Ok(())
    }

    fn head_offset(&self, pos: usize, head: usize) -> usize {
        pos * self.shape.row_len() + head * self.shape.head_dim
    }

    /// `dot(K[pos, head], q)` computed in f32.
    pub fn dot_key(&self, pos: usize, head: usize, q: &[f32]) -> KVResult<f32> {
        self.check_pos(pos)?;
        self.check_len(self.shape.head_dim, q.len())?;
        if head >= self.shape.n_heads {
            return Err(KVError::ShapeMismatch {
                expected: self.shape.n_heads,
                got: head,
            });
        }
        Ok(self.k.dot(self.head_offset(pos, head), q))
    }

    /// `out += weight * V[pos, head]`.
    pub fn accumulate_value(
        &self,
        pos: usize,
        head: usize,
        weight: f32,
        out: &mut [f32],
    ) -> KVResult<()> {
        self.check_pos(pos)?;
        self.check_len(self.shape.head_dim, out.len())?;
        if head >= self.shape.n_heads {
            return Err(KVError::ShapeMismatch {
                expected: self.shape.n_heads,
                got: head,
            });
        }
        self.v.axpy(self.head_offset(pos, head), weight, out);
        Ok(())
    }

    /// Copy the K and V rows of `pos` out as f32.
    pub fn read(&self, pos: usize, k_out: &mut [f32], v_out: &mut [f32]) -> KVResult<()> {
        self.check_pos(pos)?;
        self.check_len(self.shape.row_len(), k_out.len())?;
        self.check_len(self.shape.row_len(), v_out.len())?;
        let offset = pos * self.shape.row_len();
        self.k.read(offset, k_out);
        self.v.read(offset, v_out);
        Ok(())
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        let bytes_per = match self.k {
            KVBuffer::F16(_) => 2,
            KVBuffer::F32(_) => 4,
        };
        (self.k.len() + self.v.len()) * bytes_per
    }
}

/// Session-level KV cache managing all transformer layers.
///
/// Rows are written at positions `>= n_past` and become part of the context
/// when [`SessionKVCache::commit`] advances `n_past`. Committed positions
/// are exactly `[0, n_past)` in every layer.
#[derive(Debug, Clone)]
pub struct SessionKVCache {
    layers: Vec<LayerKVCache>,
    shape: KVShape,
    precision: KvPrecision,
    n_past: usize,
}

impl SessionKVCache {
    /// Allocate caches for `n_layers` layers.
    ///
    /// # Errors
    /// - `ShapeMismatch`: if any dimension is zero
    /// - `Allocation`: if the buffers cannot be reserved
    pub fn new(n_layers: usize, shape: KVShape, precision: KvPrecision) -> KVResult<Self> {
        if n_layers == 0 || shape.total_elements() == 0 {
            return Err(KVError::ShapeMismatch {
                expected: 1,
                got: 0,
            });
        }
        let layers = (0..n_layers)
            .map(|_| LayerKVCache::new(shape, precision))
            .collect::<KVResult<Vec<_>>>()?;

        Ok(Self {
            layers,
            shape,
            precision,
            n_past: 0,
        })
    }

    /// Get KV cache for a specific layer.
    pub fn layer(&self, layer_idx: usize) -> KVResult<&LayerKVCache> {
        self.layers.get(layer_idx).ok_or(KVError::LayerOutOfRange {
            layer: layer_idx,
            n_layers: self.layers.len(),
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn shape(&self) -> KVShape {
        self.shape
    }

    pub fn precision(&self) -> KvPrecision {
        self.precision
    }

    /// Maximum number of positions.
    pub fn capacity(&self) -> usize {
        self.shape.n_ctx
    }

    /// Number of committed positions.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Positions held per layer; equal to [`SessionKVCache::n_past`].
    pub fn positions(&self) -> usize {
        self.n_past
    }

    /// Store K/V rows for `pos` in `layer`.
    ///
    /// # Errors
    /// - `Committed`: if `pos < n_past`
    /// - `CapacityExceeded`, `ShapeMismatch`, `LayerOutOfRange`
    pub fn store(&mut self, layer: usize, pos: usize, k_row: &[f32], v_row: &[f32]) -> KVResult<()> {
        if pos < self.n_past {
            return Err(KVError::Committed {
                pos,
                n_past: self.n_past,
            });
        }
        let n_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or(KVError::LayerOutOfRange { layer, n_layers })?
            .store(pos, k_row, v_row)
    }

    /// `dot(K[layer, pos, head], q)`.
    pub fn dot_key(&self, layer: usize, pos: usize, head: usize, q: &[f32]) -> KVResult<f32> {
        self.layer(layer)?.dot_key(pos, head, q)
    }

    /// `out += weight * V[layer, pos, head]`.
    pub fn accumulate_value(
        &self,
        layer: usize,
        pos: usize,
        head: usize,
        weight: f32,
        out: &mut [f32],
    ) -> KVResult<()> {
        self.layer(layer)?.accumulate_value(pos, head, weight, out)
    }

    /// Mark `[0, n_past)` as committed.
    ///
    /// # Errors
    /// - `CapacityExceeded`: if `n_past > n_ctx`
    pub fn commit(&mut self, n_past: usize) -> KVResult<()> {
        if n_past > self.shape.n_ctx {
            return Err(KVError::CapacityExceeded {
                pos: n_past,
                max: self.shape.n_ctx,
            });
        }
        self.n_past = n_past;
        Ok(())
    }

    /// Rewind to `n_past`, discarding later positions.
    ///
    /// # Errors
    /// - `InvalidTruncate`: if `n_past` is beyond the committed positions
    pub fn truncate(&mut self, n_past: usize) -> KVResult<()> {
        if n_past > self.n_past {
            return Err(KVError::InvalidTruncate {
                requested: n_past,
                n_past: self.n_past,
            });
        }
        self.n_past = n_past;
        Ok(())
    }

    /// Forget every position.
    pub fn clear(&mut self) {
        self.n_past = 0;
    }

    /// Total memory across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }

    /// Memory holding committed positions across all layers.
    pub fn active_memory_bytes(&self) -> usize {
        self.n_past * self.shape.row_len() * 2 * self.precision.bytes_per_element() * self.layers.len()
    }
}
