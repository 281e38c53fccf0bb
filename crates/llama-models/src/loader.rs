//! Model loader: maps part files, validates the tensor set and merges
//! split checkpoints into one logical model.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_engine::{ContextParams, LlamaError, Result};
use llama_tokenizer::Vocabulary;

use crate::format::{self, FileVersion, TensorRecord};
use crate::hparams::HParams;
use crate::mmap::MappedFile;
use crate::tensor::{Payload, SplitAxis, Tensor};

/// Weights of one transformer block.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attention_norm: Tensor,
    pub wq: Tensor,
    pub wk: Tensor,
    pub wv: Tensor,
    pub wo: Tensor,
    pub ffn_norm: Tensor,
    pub w1: Tensor,
    pub w2: Tensor,
    pub w3: Tensor,
}

/// Every weight tensor of a model.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub tok_embeddings: Tensor,
    pub norm: Tensor,
    pub output: Tensor,
    pub layers: Vec<LayerWeights>,
}

impl ModelWeights {
    /// All tensors in file order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        [&self.tok_embeddings, &self.norm, &self.output]
            .into_iter()
            .chain(self.layers.iter().flat_map(|l| {
                [
                    &l.attention_norm,
                    &l.wq,
                    &l.wk,
                    &l.wv,
                    &l.wo,
                    &l.ffn_norm,
                    &l.w1,
                    &l.w2,
                    &l.w3,
                ]
            }))
    }

    /// Encoded size of every tensor.
    pub fn size_bytes(&self) -> usize {
        self.tensors().map(Tensor::size_bytes).sum()
    }
}

/// One tensor the model must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub axis: SplitAxis,
}

/// The complete tensor set implied by `hparams`, in file order.
pub fn expected_tensors(hparams: &HParams) -> Vec<ExpectedTensor> {
    let n_embd = hparams.n_embd;
    let n_vocab = hparams.n_vocab;
    let n_ff = hparams.n_ff();

    let one_d = |name: String| ExpectedTensor {
        name,
        shape: vec![n_embd],
        axis: SplitAxis::Replicated,
    };
    let two_d = |name: String, shape: [usize; 2], axis: SplitAxis| ExpectedTensor {
        name,
        shape: shape.to_vec(),
        axis,
    };

    let mut out = vec![
        two_d("tok_embeddings.weight".into(), [n_embd, n_vocab], SplitAxis::Columns),
        one_d("norm.weight".into()),
        two_d("output.weight".into(), [n_embd, n_vocab], SplitAxis::Rows),
    ];
    for i in 0..hparams.n_layer {
        let p = format!("layers.{i}");
        out.push(one_d(format!("{p}.attention_norm.weight")));
        for w in ["wq", "wk", "wv"] {
            out.push(two_d(
                format!("{p}.attention.{w}.weight"),
                [n_embd, n_embd],
                SplitAxis::Rows,
            ));
        }
        out.push(two_d(
            format!("{p}.attention.wo.weight"),
            [n_embd, n_embd],
            SplitAxis::Columns,
        ));
        out.push(one_d(format!("{p}.ffn_norm.weight")));
        out.push(two_d(
            format!("{p}.feed_forward.w1.weight"),
            [n_embd, n_ff],
            SplitAxis::Rows,
        ));
        out.push(two_d(
            format!("{p}.feed_forward.w2.weight"),
            [n_ff, n_embd],
            SplitAxis::Columns,
        ));
        out.push(two_d(
            format!("{p}.feed_forward.w3.weight"),
            [n_embd, n_ff],
            SplitAxis::Rows,
        ));
    }
    out
}

/// Path of part `index`: the base path itself for part 0, `<path>.<index>`
/// otherwise.
pub fn part_path(path: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return path.to_path_buf();
    }
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(format!(".{index}"));
    PathBuf::from(s)
}

/// A loaded model: hyperparameters, vocabulary and (unless loaded
/// vocabulary-only) weights backed by the mapped part files.
///
/// Immutable once built; share it through `Arc<Model>`.
#[derive(Debug)]
pub struct Model {
    hparams: HParams,
    version: FileVersion,
    vocab: Arc<Vocabulary>,
    weights: Option<ModelWeights>,
    parts: Vec<Arc<MappedFile>>,
}

/// Parsed contents of one part file.
struct Part {
    file: Arc<MappedFile>,
    version: FileVersion,
    hparams: HParams,
    vocab: Vocabulary,
    records: Vec<TensorRecord>,
}

impl Model {
    /// Load a model from `path` (and `path.1`, `path.2`, ... when split).
    pub fn load(path: impl AsRef<Path>, params: &ContextParams) -> Result<Model> {
        let path = path.as_ref();
        let progress = params.progress().cloned();
        let report = |fraction: f32| {
            if let Some(p) = &progress {
                p.on_progress(fraction);
            }
        };
        report(0.0);

        if params.vocab_only() {
            let model = Self::load_vocab_only(path)?;
            report(1.0);
            return Ok(model);
        }

        let first = Self::read_part(path, params.use_mlock())?;
        let n_parts = params
            .n_parts()
            .unwrap_or_else(|| first.hparams.default_n_parts());
        tracing::info!(
            path = %path.display(),
            version = ?first.version,
            n_vocab = first.hparams.n_vocab,
            n_embd = first.hparams.n_embd,
            n_layer = first.hparams.n_layer,
            n_ff = first.hparams.n_ff(),
            ftype = first.hparams.ftype,
            n_parts,
            "loading model"
        );

        let mut parts = Vec::with_capacity(n_parts);
        parts.push(first);
        for i in 1..n_parts {
            let part = Self::read_part(&part_path(path, i), params.use_mlock())?;
            if part.hparams != parts[0].hparams {
                return Err(LlamaError::Format(format!(
                    "part {i} hyperparameters {:?} differ from part 0 {:?}",
                    part.hparams, parts[0].hparams
                )));
            }
            parts.push(part);
        }

        let total_bytes: usize = parts.iter().map(|p| p.file.size()).sum();
        let mut done_bytes = 0usize;
        let mut on_record = |len: usize| {
            done_bytes += len;
            // Headers are counted in the final step.
            report((done_bytes as f32 / total_bytes.max(1) as f32).min(0.999));
        };

        let hparams = parts[0].hparams;
        let weights = merge_parts(&hparams, &parts, &mut on_record)?;

        let mut rest = parts.into_iter();
        let (version, vocab, mut files) = match rest.next() {
            Some(first) => (first.version, first.vocab, vec![first.file]),
            None => return Err(LlamaError::Format("model has no parts".into())),
        };
        files.extend(rest.map(|p| p.file));

        tracing::info!(
            tensors = weights.tensors().count(),
            weight_bytes = weights.size_bytes(),
            "model loaded"
        );
        report(1.0);

        Ok(Model {
            hparams,
            version,
            vocab: Arc::new(vocab),
            weights: Some(weights),
            parts: files,
        })
    }

    fn load_vocab_only(path: &Path) -> Result<Model> {
        let file = File::open(path).map_err(|e| {
            LlamaError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open {}: {e}", path.display()),
            ))
        })?;
        let mut reader = BufReader::new(file);
        let (version, hparams) = format::read_header(&mut reader)?;
        let vocab = format::read_vocab(&mut reader, version, hparams.n_vocab)?;
        tracing::info!(path = %path.display(), n_vocab = vocab.len(), "loaded vocabulary only");
        Ok(Model {
            hparams,
            version,
            vocab: Arc::new(vocab),
            weights: None,
            parts: Vec::new(),
        })
    }

    fn read_part(path: &Path, use_mlock: bool) -> Result<Part> {
        let mut file = MappedFile::open(path)?;
        if use_mlock {
            if let Err(e) = file.lock() {
                tracing::warn!(path = %path.display(), "mlock failed, continuing unpinned: {e}");
            }
        }
        let file = Arc::new(file);

        let mut cur = Cursor::new(file.as_bytes());
        let (version, hparams) = format::read_header(&mut cur)?;
        let vocab = format::read_vocab(&mut cur, version, hparams.n_vocab)?;
        let records = format::read_tensor_records(&mut cur, version)?;
        tracing::debug!(path = %path.display(), tensors = records.len(), "parsed part");

        Ok(Part {
            file,
            version,
            hparams,
            vocab,
            records,
        })
    }

    /// Assemble a model from in-memory parts.
    pub fn from_parts(hparams: HParams, vocab: Vocabulary, weights: ModelWeights) -> Result<Model> {
        check_weights(&hparams, &weights)?;
        Ok(Model {
            hparams,
            version: FileVersion::V1,
            vocab: Arc::new(vocab),
            weights: Some(weights),
            parts: Vec::new(),
        })
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn file_version(&self) -> FileVersion {
        self.version
    }

    pub fn vocab(&self) -> &Arc<Vocabulary> {
        &self.vocab
    }

    /// `None` when loaded vocabulary-only.
    pub fn weights(&self) -> Option<&ModelWeights> {
        self.weights.as_ref()
    }

    /// Number of part files backing the weights.
    pub fn n_parts(&self) -> usize {
        self.parts.len()
    }

    pub fn is_locked(&self) -> bool {
        !self.parts.is_empty() && self.parts.iter().all(|p| p.is_locked())
    }
}

/// Validate the records of every part and merge them into [`ModelWeights`].
fn merge_parts(
    hparams: &HParams,
    parts: &[Part],
    on_record: &mut dyn FnMut(usize),
) -> Result<ModelWeights> {
    let mut by_part: Vec<HashMap<&str, &TensorRecord>> = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let mut map = HashMap::with_capacity(part.records.len());
        for rec in &part.records {
            if map.insert(rec.name.as_str(), rec).is_some() {
                return Err(LlamaError::Format(format!(
                    "part {i}: duplicate tensor {}",
                    rec.name
                )));
            }
        }
        by_part.push(map);
    }

    let expected = expected_tensors(hparams);
    for (i, map) in by_part.iter().enumerate() {
        if let Some(unknown) = map
            .keys()
            .find(|name| !expected.iter().any(|e| e.name == **name))
        {
            return Err(LlamaError::Format(format!("part {i}: unknown tensor {unknown}")));
        }
    }

    let mut merged: HashMap<String, Tensor> = HashMap::with_capacity(expected.len());
    for exp in &expected {
        let mut shards = Vec::with_capacity(parts.len());
        for (i, (part, map)) in parts.iter().zip(&by_part).enumerate() {
            let rec = map.get(exp.name.as_str()).ok_or_else(|| {
                LlamaError::Format(format!("part {i}: missing tensor {}", exp.name))
            })?;
            let payload = Payload::mapped(part.file.clone(), rec.offset, rec.len)?;
            shards.push(Tensor::new(
                rec.name.clone(),
                rec.shape.clone(),
                rec.elem,
                rec.block_size,
                payload,
            )?);
            on_record(rec.len);
        }
        let tensor = Tensor::merge(exp.axis, shards)?;
        if tensor.shape() != exp.shape.as_slice() {
            return Err(LlamaError::Format(format!(
                "{}: shape {:?}, expected {:?}",
                exp.name,
                tensor.shape(),
                exp.shape
            )));
        }
        merged.insert(exp.name.clone(), tensor);
    }

    let mut take = |name: String| {
        merged
            .remove(&name)
            .ok_or_else(|| LlamaError::Format(format!("missing tensor {name}")))
    };
    let tok_embeddings = take("tok_embeddings.weight".into())?;
    let norm = take("norm.weight".into())?;
    let output = take("output.weight".into())?;
    let mut layers = Vec::with_capacity(hparams.n_layer);
    for i in 0..hparams.n_layer {
        let p = format!("layers.{i}");
        layers.push(LayerWeights {
            attention_norm: take(format!("{p}.attention_norm.weight"))?,
            wq: take(format!("{p}.attention.wq.weight"))?,
            wk: take(format!("{p}.attention.wk.weight"))?,
            wv: take(format!("{p}.attention.wv.weight"))?,
            wo: take(format!("{p}.attention.wo.weight"))?,
            ffn_norm: take(format!("{p}.ffn_norm.weight"))?,
            w1: take(format!("{p}.feed_forward.w1.weight"))?,
            w2: take(format!("{p}.feed_forward.w2.weight"))?,
            w3: take(format!("{p}.feed_forward.w3.weight"))?,
        });
    }

    Ok(ModelWeights {
        tok_embeddings,
        norm,
        output,
        layers,
    })
}

/// Shape check for weights assembled in memory.
fn check_weights(hparams: &HParams, weights: &ModelWeights) -> Result<()> {
    if weights.layers.len() != hparams.n_layer {
        return Err(LlamaError::Format(format!(
            "{} layers, expected {}",
            weights.layers.len(),
            hparams.n_layer
        )));
    }
    for (exp, tensor) in expected_tensors(hparams).iter().zip(weights.tensors()) {
        if tensor.shape() != exp.shape.as_slice() {
            return Err(LlamaError::Format(format!(
                "{}: shape {:?}, expected {:?}",
                exp.name,
                tensor.shape(),
                exp.shape
            )));
        }
    }
    Ok(())
}
