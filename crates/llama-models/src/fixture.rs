//! Deterministic synthetic models for tests, demos and benchmarks.
//!
//! Weights are drawn from a fixed-seed generator, so the same
//! [`FixtureConfig`] always produces byte-identical files. Split
//! checkpoints are written by slicing each tensor along its split axis.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use half::f16;

use llama_engine::{LlamaError, Result};
use llama_tokenizer::Vocabulary;

use crate::format::{f32_bytes, FileVersion, ModelWriter};
use crate::hparams::HParams;
use crate::loader::{expected_tensors, part_path};
use crate::tensor::{ElemType, SplitAxis};

/// Letters every fixture vocabulary can spell.
const ALPHABET: &str = " abcdefghijklmnopqrstuvwxyz";

/// Merges appended after the alphabet, best first.
const MERGES: [&str; 20] = [
    " t", "th", "he", "the", " the", "in", "an", "er", "on", "re", "at", "en", "ed", "nd", "ou",
    "is", "or", " a", " s", " w",
];

/// What to write.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub hparams: HParams,
    pub n_parts: usize,
    pub seed: u64,
    pub version: FileVersion,
    /// Element type of the 2-D weights: `F32` or `F16`.
    pub weight_type: ElemType,
}

impl FixtureConfig {
    /// A two-layer model small enough to evaluate in microseconds.
    pub fn tiny() -> Self {
        Self {
            hparams: HParams {
                n_vocab: 50,
                n_embd: 32,
                n_mult: 32,
                n_head: 4,
                n_layer: 2,
                n_rot: 8,
                ftype: 0,
            },
            n_parts: 1,
            seed: 0x5eed,
            version: FileVersion::V1,
            weight_type: ElemType::F32,
        }
    }

    pub fn with_parts(mut self, n_parts: usize) -> Self {
        self.n_parts = n_parts;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_version(mut self, version: FileVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_weight_type(mut self, elem: ElemType) -> Self {
        self.weight_type = elem;
        self.hparams.ftype = elem.tag();
        self
    }
}

/// Control tokens, the alphabet, a handful of merges, then filler entries up
/// to `n_vocab`.
pub fn synthetic_vocab(n_vocab: usize) -> Vocabulary {
    let mut entries: Vec<(Vec<u8>, f32)> = vec![
        (" \u{2047} ".into(), 0.0),
        (Vec::new(), 0.0),
        (Vec::new(), 0.0),
    ];
    entries.extend(ALPHABET.bytes().map(|b| (vec![b], 0.0)));
    entries.extend(
        MERGES
            .iter()
            .enumerate()
            .map(|(i, m)| (m.as_bytes().to_vec(), -(i as f32) - 1.0)),
    );
    let mut extra = 0;
    while entries.len() < n_vocab {
        entries.push((format!("<extra_{extra}>").into_bytes(), -1000.0));
        extra += 1;
    }
    entries.truncate(n_vocab);
    Vocabulary::from_entries(entries)
}

/// SplitMix64; enough for reproducible weights.
struct WeightRng(u64);

impl WeightRng {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[-1, 1)`.
    fn next_signed(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
    }
}

/// Named full-size tensors of a synthetic model, in file order.
pub fn synthetic_weights(hparams: &HParams, seed: u64) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let mut rng = WeightRng(seed);
    expected_tensors(hparams)
        .into_iter()
        .map(|exp| {
            let n: usize = exp.shape.iter().product();
            let data: Vec<f32> = if exp.shape.len() == 1 {
                (0..n).map(|_| 1.0 + 0.1 * rng.next_signed()).collect()
            } else {
                let scale = 1.0 / (exp.shape[0] as f32).sqrt();
                (0..n).map(|_| scale * rng.next_signed()).collect()
            };
            (exp.name, exp.shape, data)
        })
        .collect()
}

/// Write a synthetic model to `path` (plus `path.1`, ... when split).
pub fn write_model(path: impl AsRef<Path>, config: &FixtureConfig) -> Result<()> {
    let path = path.as_ref();
    if config.n_parts == 0 {
        return Err(LlamaError::InvalidArgument("n_parts must be at least 1".into()));
    }
    if !matches!(config.weight_type, ElemType::F32 | ElemType::F16) {
        return Err(LlamaError::UnsupportedType(format!(
            "fixtures are written as f32 or f16, not {}",
            config.weight_type
        )));
    }
    config.hparams.validate()?;

    let vocab = synthetic_vocab(config.hparams.n_vocab);
    let weights = synthetic_weights(&config.hparams, config.seed);
    let axes: Vec<SplitAxis> = expected_tensors(&config.hparams)
        .into_iter()
        .map(|e| e.axis)
        .collect();

    for part in 0..config.n_parts {
        let file = File::create(part_path(path, part))?;
        let mut w = ModelWriter::new(BufWriter::new(file), config.version);
        w.write_header(&config.hparams)?;
        w.write_vocab(&vocab)?;

        for ((name, shape, data), &axis) in weights.iter().zip(&axes) {
            let (shape, slice) = split(shape, data, axis, part, config.n_parts)?;
            let elem = if shape.len() == 2 {
                config.weight_type
            } else {
                ElemType::F32
            };
            let payload: Vec<u8> = match elem {
                ElemType::F16 => slice
                    .iter()
                    .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                    .collect(),
                _ => f32_bytes(&slice),
            };
            w.write_tensor(name, &shape, elem, 32, &payload)?;
        }
        std::io::Write::flush(&mut w.into_inner())?;
    }
    Ok(())
}

/// The piece of a row-major tensor that part `part` of `n_parts` stores.
fn split(
    shape: &[usize],
    data: &[f32],
    axis: SplitAxis,
    part: usize,
    n_parts: usize,
) -> Result<(Vec<usize>, Vec<f32>)> {
    match axis {
        SplitAxis::Replicated => Ok((shape.to_vec(), data.to_vec())),
        SplitAxis::Columns => {
            let (row_len, n_rows) = (shape[0], shape[1]);
            if row_len % n_parts != 0 {
                return Err(LlamaError::InvalidArgument(format!(
                    "row length {row_len} does not split into {n_parts} parts"
                )));
            }
            let width = row_len / n_parts;
            let out = data
                .chunks_exact(row_len)
                .flat_map(|row| row[part * width..(part + 1) * width].iter().copied())
                .collect();
            Ok((vec![width, n_rows], out))
        }
        SplitAxis::Rows => {
            let (row_len, n_rows) = (shape[0], shape[1]);
            if n_rows % n_parts != 0 {
                return Err(LlamaError::InvalidArgument(format!(
                    "{n_rows} rows do not split into {n_parts} parts"
                )));
            }
            let rows = n_rows / n_parts;
            let start = part * rows * row_len;
            Ok((vec![row_len, rows], data[start..start + rows * row_len].to_vec()))
        }
    }
}
