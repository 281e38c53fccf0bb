//! Tensor store: descriptors plus bounds-checked, typed access to payloads.
//!
//! A [`Tensor`] is one logical weight matrix (or vector) backed by one or
//! more shards. Shards come from separate part files of a split checkpoint
//! and are never copied together; row access walks the shards instead.

use std::fmt;
use std::sync::Arc;

use llama_engine::{LlamaError, Result};

use crate::mmap::MappedFile;
use crate::quant;

/// Element encoding of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ElemType {
    F32,
    F16,
    Q4_0,
    Q4_1,
}

impl ElemType {
    /// Decode the on-disk type tag.
    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(ElemType::F32),
            1 => Ok(ElemType::F16),
            2 => Ok(ElemType::Q4_0),
            3 => Ok(ElemType::Q4_1),
            other => Err(LlamaError::Format(format!("unknown tensor type tag {other}"))),
        }
    }

    /// Map a quantization target id (2 or 3) to its element type.
    pub fn from_quant_type(itype: i32) -> Result<Self> {
        match itype {
            2 => Ok(ElemType::Q4_0),
            3 => Ok(ElemType::Q4_1),
            other => Err(LlamaError::UnsupportedType(format!(
                "quantization type {other} (expected 2 = q4_0 or 3 = q4_1)"
            ))),
        }
    }

    pub fn tag(self) -> i32 {
        match self {
            ElemType::F32 => 0,
            ElemType::F16 => 1,
            ElemType::Q4_0 => 2,
            ElemType::Q4_1 => 3,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, ElemType::Q4_0 | ElemType::Q4_1)
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElemType::F32 => "f32",
            ElemType::F16 => "f16",
            ElemType::Q4_0 => "q4_0",
            ElemType::Q4_1 => "q4_1",
        };
        write!(f, "{name}")
    }
}

/// How a tensor is divided between the parts of a split checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    /// Every part carries the full tensor; part 0 is used.
    Replicated,
    /// Each part carries a slice of every row (`shape[0]` is divided).
    Columns,
    /// Each part carries a contiguous range of rows (`shape[1]` is divided).
    Rows,
}

/// Backing bytes of one shard.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A range of a memory-mapped part file.
    Mapped {
        file: Arc<MappedFile>,
        offset: usize,
        len: usize,
    },
    /// Bytes owned by the process.
    Owned(Vec<u8>),
}

impl Payload {
    /// A view into `file`, checked against the file size.
    pub fn mapped(file: Arc<MappedFile>, offset: usize, len: usize) -> Result<Self> {
        file.slice(offset, len)?;
        Ok(Payload::Mapped { file, offset, len })
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Mapped { file, offset, len } => &file.as_bytes()[*offset..*offset + *len],
            Payload::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Mapped { len, .. } => *len,
            Payload::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Payload::Mapped { .. })
    }
}

/// One contiguous, row-major block of a tensor.
#[derive(Debug, Clone)]
pub struct Shard {
    payload: Payload,
    row_len: usize,
    n_rows: usize,
    row_bytes: usize,
}

impl Shard {
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    fn row(&self, row: usize) -> &[u8] {
        let start = row * self.row_bytes;
        &self.payload.bytes()[start..start + self.row_bytes]
    }
}

/// A named, typed weight tensor.
///
/// `shape[0]` is the row length; a 1-D tensor is a single row.
#[derive(Debug, Clone)]
pub struct Tensor {
    name: String,
    shape: Vec<usize>,
    elem: ElemType,
    block_size: usize,
    axis: SplitAxis,
    shards: Vec<Shard>,
}

impl Tensor {
    /// A single-shard tensor. The payload must hold exactly the encoded size
    /// of `shape`.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        elem: ElemType,
        block_size: usize,
        payload: Payload,
    ) -> Result<Self> {
        let name = name.into();
        let (row_len, n_rows) = match shape[..] {
            [n] => (n, 1),
            [n, m] => (n, m),
            _ => {
                return Err(LlamaError::Format(format!(
                    "{name}: expected 1 or 2 dimensions, got {}",
                    shape.len()
                )))
            }
        };
        if row_len == 0 || n_rows == 0 {
            return Err(LlamaError::Format(format!("{name}: empty shape {shape:?}")));
        }
        if elem.is_quantized() {
            quant::validate_block_size(block_size)
                .map_err(|e| LlamaError::Format(format!("{name}: {e}")))?;
            if row_len % block_size != 0 {
                return Err(LlamaError::Format(format!(
                    "{name}: row length {row_len} is not a multiple of block size {block_size}"
                )));
            }
        }

        let row_bytes = quant::row_bytes(elem, row_len, block_size);
        let expected = row_bytes
            .checked_mul(n_rows)
            .ok_or_else(|| LlamaError::Format(format!("{name}: shape {shape:?} overflows")))?;
        if payload.len() != expected {
            return Err(LlamaError::Format(format!(
                "{name}: payload is {} bytes, shape {shape:?} of {elem} needs {expected}",
                payload.len()
            )));
        }

        Ok(Self {
            name,
            shape,
            elem,
            block_size,
            axis: SplitAxis::Replicated,
            shards: vec![Shard {
                payload,
                row_len,
                n_rows,
                row_bytes,
            }],
        })
    }

    /// An owned f32 tensor.
    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(data.len() * 4)?;
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(name, shape, ElemType::F32, quant::LEGACY_BLOCK_SIZE, Payload::Owned(bytes))
    }

    /// Join per-part tensors into one logical tensor along `axis`.
    ///
    /// Each input must be single-shard with the same element type and block
    /// size. The shards are kept as they are; nothing is copied.
    pub fn merge(axis: SplitAxis, parts: Vec<Tensor>) -> Result<Tensor> {
        let mut iter = parts.into_iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| LlamaError::Format("cannot merge zero tensor parts".into()))?;

        for part in iter {
            if part.elem != merged.elem || part.block_size != merged.block_size {
                return Err(LlamaError::Format(format!(
                    "{}: parts disagree on element type ({} vs {})",
                    merged.name, merged.elem, part.elem
                )));
            }
            match axis {
                SplitAxis::Replicated => {
                    if part.shape != merged.shape {
                        return Err(LlamaError::Format(format!(
                            "{}: replicated parts disagree on shape ({:?} vs {:?})",
                            merged.name, merged.shape, part.shape
                        )));
                    }
                }
                SplitAxis::Columns => {
                    if part.n_dims() != 2 || part.n_rows() != merged.n_rows() {
                        return Err(LlamaError::Format(format!(
                            "{}: column-split part has shape {:?}, expected {} rows",
                            merged.name,
                            part.shape,
                            merged.n_rows()
                        )));
                    }
                    merged.shape[0] += part.shape[0];
                    merged.shards.extend(part.shards);
                }
                SplitAxis::Rows => {
                    if part.n_dims() != 2 || part.row_len() != merged.row_len() {
                        return Err(LlamaError::Format(format!(
                            "{}: row-split part has shape {:?}, expected row length {}",
                            merged.name,
                            part.shape,
                            merged.row_len()
                        )));
                    }
                    merged.shape[1] += part.shape[1];
                    merged.shards.extend(part.shards);
                }
            }
        }

        merged.axis = axis;
        Ok(merged)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_dims(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_type(&self) -> ElemType {
        self.elem
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn split_axis(&self) -> SplitAxis {
        self.axis
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Number of values in one logical row.
    pub fn row_len(&self) -> usize {
        self.shape[0]
    }

    pub fn n_rows(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }

    pub fn n_elements(&self) -> usize {
        self.row_len() * self.n_rows()
    }

    /// Encoded size of all shards.
    pub fn size_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.payload.len()).sum()
    }

    /// Whether every shard is served from a mapped file.
    pub fn is_mapped(&self) -> bool {
        self.shards.iter().all(|s| s.payload.is_mapped())
    }

    fn check_row(&self, row: usize, width: usize) -> Result<()> {
        if row >= self.n_rows() {
            return Err(LlamaError::InvalidArgument(format!(
                "{}: row {row} out of range ({} rows)",
                self.name,
                self.n_rows()
            )));
        }
        if width != self.row_len() {
            return Err(LlamaError::InvalidArgument(format!(
                "{}: buffer of {width} values for rows of {}",
                self.name,
                self.row_len()
            )));
        }
        Ok(())
    }

    /// Locate `row` for row-split tensors.
    fn shard_for_row(&self, mut row: usize) -> (&Shard, usize) {
        for shard in &self.shards {
            if row < shard.n_rows {
                return (shard, row);
            }
            row -= shard.n_rows;
        }
        let last = &self.shards[self.shards.len() - 1];
        (last, last.n_rows - 1)
    }

    /// Dequantize one row into `out` (`out.len() == row_len()`).
    pub fn read_row(&self, row: usize, out: &mut [f32]) -> Result<()> {
        self.check_row(row, out.len())?;
        match self.axis {
            SplitAxis::Columns => {
                let mut start = 0;
                for shard in &self.shards {
                    let dst = &mut out[start..start + shard.row_len];
                    quant::dequantize_row(self.elem, shard.row(row), self.block_size, dst);
                    start += shard.row_len;
                }
            }
            SplitAxis::Rows | SplitAxis::Replicated => {
                let (shard, local) = self.shard_for_row(row);
                quant::dequantize_row(self.elem, shard.row(local), self.block_size, out);
            }
        }
        Ok(())
    }

    /// Dot product of one row with `x` (`x.len() == row_len()`).
    ///
    /// Column-split rows are the sum of the per-shard partial products.
    pub fn dot_row(&self, row: usize, x: &[f32]) -> Result<f32> {
        self.check_row(row, x.len())?;
        Ok(self.dot_row_unchecked(row, x))
    }

    /// [`Tensor::dot_row`] for callers that validated `row` and `x` once
    /// for a whole matrix product.
    pub(crate) fn dot_row_unchecked(&self, row: usize, x: &[f32]) -> f32 {
        match self.axis {
            SplitAxis::Columns => {
                let mut start = 0;
                let mut acc = 0.0f32;
                for shard in &self.shards {
                    let xs = &x[start..start + shard.row_len];
                    acc += quant::dot_row(self.elem, shard.row(row), self.block_size, xs);
                    start += shard.row_len;
                }
                acc
            }
            SplitAxis::Rows | SplitAxis::Replicated => {
                let (shard, local) = self.shard_for_row(row);
                quant::dot_row(self.elem, shard.row(local), self.block_size, x)
            }
        }
    }

    /// `out[r] = dot(row r, x)` for `r` in `rows`.
    pub fn dot_rows(&self, rows: std::ops::Range<usize>, x: &[f32], out: &mut [f32]) -> Result<()> {
        if rows.end > self.n_rows() || rows.len() != out.len() {
            return Err(LlamaError::InvalidArgument(format!(
                "{}: rows {rows:?} into {} outputs ({} rows)",
                self.name,
                out.len(),
                self.n_rows()
            )));
        }
        if x.len() != self.row_len() {
            return Err(LlamaError::InvalidArgument(format!(
                "{}: input of {} values for rows of {}",
                self.name,
                x.len(),
                self.row_len()
            )));
        }
        for (dst, row) in out.iter_mut().zip(rows) {
            *dst = self.dot_row_unchecked(row, x);
        }
        Ok(())
    }

    /// Dequantize the whole logical tensor, row-major.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.n_elements())?;
        data.resize(self.n_elements(), 0.0);
        for (row, out) in data.chunks_exact_mut(self.row_len()).enumerate() {
            self.read_row(row, out)?;
        }
        Ok(data)
    }
}
