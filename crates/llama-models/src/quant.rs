//! Block codecs for the 4-bit weight formats.
//!
//! A quantized row is a sequence of blocks of `block_size` values each.
//!
//! | type | block layout                                     | decode          |
//! |------|--------------------------------------------------|-----------------|
//! | Q4_0 | `f32 d`, `block_size / 2` code bytes             | `d * (q - 8)`   |
//! | Q4_1 | `f32 d`, `f32 m`, `block_size / 2` code bytes    | `d * q + m`     |
//!
//! Codes are packed two per byte, low nibble first. All scalars are
//! little-endian.
//!
//! Dot products dequantize one block at a time into a stack buffer and
//! accumulate sequentially, so the result for a row never depends on how
//! callers partition work.

use half::f16;

use llama_engine::{LlamaError, Result};

use crate::tensor::ElemType;

/// Block size of files written before the block size was recorded.
pub const LEGACY_BLOCK_SIZE: usize = 32;

/// Largest supported block.
pub const MAX_BLOCK_SIZE: usize = 256;

/// Number of distinct 4-bit codes.
pub const N_CODES: usize = 16;

/// Block sizes must be even and within `2..=256`.
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if block_size < 2 || block_size > MAX_BLOCK_SIZE || block_size % 2 != 0 {
        return Err(LlamaError::InvalidArgument(format!(
            "block size {block_size} must be even and within 2..={MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Encoded size of one block.
pub fn block_bytes(elem: ElemType, block_size: usize) -> usize {
    match elem {
        ElemType::F32 => 4 * block_size,
        ElemType::F16 => 2 * block_size,
        ElemType::Q4_0 => 4 + block_size / 2,
        ElemType::Q4_1 => 8 + block_size / 2,
    }
}

/// Encoded size of a row of `row_len` values.
pub fn row_bytes(elem: ElemType, row_len: usize, block_size: usize) -> usize {
    match elem {
        ElemType::F32 => 4 * row_len,
        ElemType::F16 => 2 * row_len,
        ElemType::Q4_0 | ElemType::Q4_1 => (row_len / block_size) * block_bytes(elem, block_size),
    }
}

/// Append the Q4_0 encoding of `row` to `out`, counting emitted codes.
pub fn quantize_row_q4_0(
    row: &[f32],
    block_size: usize,
    out: &mut Vec<u8>,
    hist: &mut [u64; N_CODES],
) {
    for block in row.chunks_exact(block_size) {
        let amax = block.iter().fold(0.0f32, |m, &v| m.max(v.abs()));
        let d = amax / 7.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        out.extend_from_slice(&d.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let q0 = ((pair[0] * id).round() + 8.0).clamp(0.0, 15.0) as u8;
            let q1 = ((pair[1] * id).round() + 8.0).clamp(0.0, 15.0) as u8;
            hist[q0 as usize] += 1;
            hist[q1 as usize] += 1;
            out.push(q0 | (q1 << 4));
        }
    }
}

/// Append the Q4_1 encoding of `row` to `out`, counting emitted codes.
pub fn quantize_row_q4_1(
    row: &[f32],
    block_size: usize,
    out: &mut Vec<u8>,
    hist: &mut [u64; N_CODES],
) {
    for block in row.chunks_exact(block_size) {
        let (min, max) = block
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let d = (max - min) / 15.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };

        out.extend_from_slice(&d.to_le_bytes());
        out.extend_from_slice(&min.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let q0 = ((pair[0] - min) * id).round().clamp(0.0, 15.0) as u8;
            let q1 = ((pair[1] - min) * id).round().clamp(0.0, 15.0) as u8;
            hist[q0 as usize] += 1;
            hist[q1 as usize] += 1;
            out.push(q0 | (q1 << 4));
        }
    }
}

/// Decode one encoded row into `out`. `bytes` must hold exactly one row.
pub fn dequantize_row(elem: ElemType, bytes: &[u8], block_size: usize, out: &mut [f32]) {
    match elem {
        ElemType::F32 => {
            for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *dst = read_f32(src);
            }
        }
        ElemType::F16 => {
            for (dst, src) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *dst = f16::from_le_bytes([src[0], src[1]]).to_f32();
            }
        }
        ElemType::Q4_0 | ElemType::Q4_1 => {
            let stride = block_bytes(elem, block_size);
            for (dst, block) in out
                .chunks_exact_mut(block_size)
                .zip(bytes.chunks_exact(stride))
            {
                decode_block(elem, block, dst);
            }
        }
    }
}

/// Dot product of one encoded row with `x`.
pub fn dot_row(elem: ElemType, bytes: &[u8], block_size: usize, x: &[f32]) -> f32 {
    match elem {
        ElemType::F32 => bytes
            .chunks_exact(4)
            .zip(x)
            .fold(0.0f32, |acc, (src, &v)| acc + read_f32(src) * v),
        ElemType::F16 => bytes
            .chunks_exact(2)
            .zip(x)
            .fold(0.0f32, |acc, (src, &v)| {
                acc + f16::from_le_bytes([src[0], src[1]]).to_f32() * v
            }),
        ElemType::Q4_0 | ElemType::Q4_1 => {
            let stride = block_bytes(elem, block_size);
            let mut scratch = [0.0f32; MAX_BLOCK_SIZE];
            let buf = &mut scratch[..block_size];
            let mut acc = 0.0f32;
            for (block, xs) in bytes.chunks_exact(stride).zip(x.chunks_exact(block_size)) {
                decode_block(elem, block, buf);
                acc = buf.iter().zip(xs).fold(acc, |acc, (&w, &v)| acc + w * v);
            }
            acc
        }
    }
}

fn decode_block(elem: ElemType, block: &[u8], out: &mut [f32]) {
    let d = read_f32(&block[0..4]);
    let (offset, m) = match elem {
        ElemType::Q4_1 => (8, read_f32(&block[4..8])),
        _ => (4, 0.0),
    };
    for (pair, &byte) in out.chunks_exact_mut(2).zip(&block[offset..]) {
        let lo = (byte & 0x0f) as f32;
        let hi = (byte >> 4) as f32;
        match elem {
            ElemType::Q4_1 => {
                pair[0] = d * lo + m;
                pair[1] = d * hi + m;
            }
            _ => {
                pair[0] = d * (lo - 8.0);
                pair[1] = d * (hi - 8.0);
            }
        }
    }
}

fn read_f32(src: &[u8]) -> f32 {
    f32::from_le_bytes([src[0], src[1], src[2], src[3]])
}
