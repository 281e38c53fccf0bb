//! Offline quantizer: re-encode a model file's 2-D weights as Q4_0 or Q4_1.

use std::io::{BufWriter, Cursor, Write};
use std::path::Path;
use std::sync::Arc;

use llama_engine::{LlamaError, Result};

use crate::format::{self, FileVersion, ModelWriter};
use crate::mmap::MappedFile;
use crate::quant::{self, N_CODES};
use crate::tensor::{ElemType, Payload, Tensor};

/// Per-tensor outcome of a quantization run.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorReport {
    pub name: String,
    pub shape: Vec<usize>,
    pub source_type: ElemType,
    pub output_type: ElemType,
    pub original_bytes: usize,
    pub quantized_bytes: usize,
}

/// Summary of a quantization run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizeReport {
    pub target: ElemType,
    pub block_size: usize,
    pub tensors: Vec<TensorReport>,
    /// Number of times each 4-bit code was emitted.
    pub histogram: [u64; N_CODES],
}

impl QuantizeReport {
    pub fn original_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.original_bytes).sum()
    }

    pub fn quantized_bytes(&self) -> usize {
        self.tensors.iter().map(|t| t.quantized_bytes).sum()
    }

    /// Histogram normalised to fractions of all emitted codes.
    pub fn histogram_fractions(&self) -> [f64; N_CODES] {
        let total: u64 = self.histogram.iter().sum();
        let mut out = [0.0; N_CODES];
        if total > 0 {
            for (dst, &count) in out.iter_mut().zip(&self.histogram) {
                *dst = count as f64 / total as f64;
            }
        }
        out
    }
}

/// Quantize the model at `input` into `output`.
///
/// `itype` selects the target (2 = Q4_0, 3 = Q4_1). The output only becomes
/// visible once completely written.
pub fn quantize(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    itype: i32,
    block_size: usize,
) -> Result<QuantizeReport> {
    let input = input.as_ref();
    let output = output.as_ref();
    let target = ElemType::from_quant_type(itype)?;
    quant::validate_block_size(block_size)?;

    let file = Arc::new(MappedFile::open(input)?);
    let mut cur = Cursor::new(file.as_bytes());
    let (version, mut hparams) = format::read_header(&mut cur)?;
    let vocab = format::read_vocab(&mut cur, version, hparams.n_vocab)?;
    let records = format::read_tensor_records(&mut cur, version)?;

    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        target = %target,
        block_size,
        tensors = records.len(),
        "quantizing"
    );

    // Reject before writing anything.
    if let Some(rec) = records
        .iter()
        .find(|r| r.shape.len() == 2 && r.shape[0] % block_size != 0)
    {
        return Err(LlamaError::InvalidArgument(format!(
            "{}: row length {} is not a multiple of block size {block_size}",
            rec.name, rec.shape[0]
        )));
    }

    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut writer = ModelWriter::new(BufWriter::new(tmp), FileVersion::V1);

    hparams.ftype = target.tag();
    writer.write_header(&hparams)?;
    writer.write_vocab(&vocab)?;

    let mut report = QuantizeReport {
        target,
        block_size,
        tensors: Vec::with_capacity(records.len()),
        histogram: [0; N_CODES],
    };

    for rec in &records {
        let payload = Payload::mapped(file.clone(), rec.offset, rec.len)?;
        let tensor = Tensor::new(
            rec.name.clone(),
            rec.shape.clone(),
            rec.elem,
            rec.block_size,
            payload,
        )?;

        let mut row = vec![0.0f32; tensor.row_len()];
        let out_type = if tensor.n_dims() == 2 { target } else { ElemType::F32 };
        let mut encoded = Vec::new();
        encoded.try_reserve_exact(quant::row_bytes(out_type, tensor.row_len(), block_size) * tensor.n_rows())?;
        let mut hist = [0u64; N_CODES];

        for r in 0..tensor.n_rows() {
            tensor.read_row(r, &mut row)?;
            match out_type {
                ElemType::Q4_0 => quant::quantize_row_q4_0(&row, block_size, &mut encoded, &mut hist),
                ElemType::Q4_1 => quant::quantize_row_q4_1(&row, block_size, &mut encoded, &mut hist),
                _ => encoded.extend(row.iter().flat_map(|v| v.to_le_bytes())),
            }
        }

        writer.write_tensor(&rec.name, &rec.shape, out_type, block_size, &encoded)?;
        for (total, n) in report.histogram.iter_mut().zip(hist) {
            *total += n;
        }

        tracing::debug!(
            name = %rec.name,
            shape = ?rec.shape,
            from = %rec.elem,
            to = %out_type,
            original_bytes = rec.len,
            quantized_bytes = encoded.len(),
            "tensor done"
        );
        report.tensors.push(TensorReport {
            name: rec.name.clone(),
            shape: rec.shape.clone(),
            source_type: rec.elem,
            output_type: out_type,
            original_bytes: rec.len,
            quantized_bytes: encoded.len(),
        });
    }

    let mut buffered = writer.into_inner();
    buffered.flush()?;
    let tmp = buffered
        .into_inner()
        .map_err(|e| LlamaError::Io(e.into_error()))?;
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| LlamaError::Io(e.error))?;

    let hist = report
        .histogram_fractions()
        .iter()
        .map(|f| format!("{f:.3}"))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(
        original_mb = report.original_bytes() as f64 / (1024.0 * 1024.0),
        quantized_mb = report.quantized_bytes() as f64 / (1024.0 * 1024.0),
        histogram = %hist,
        "quantization complete"
    );

    Ok(report)
}
