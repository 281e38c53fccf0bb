//! Binary model file format: reading and writing.
//!
//! ```text
//! u32 magic            "ggmf" (versioned) or "ggml" (legacy)
//! u32 version          versioned files only, must be 1
//! i32 hparams[7]       n_vocab n_embd n_mult n_head n_layer n_rot ftype
//! n_vocab × { u32 len, u8 bytes[len], f32 score }   (legacy: no score)
//! until EOF × {
//!     i32 n_dims, i32 name_len, i32 type
//!     i32 block_size   versioned files, quantized types only
//!     i32 dims[n_dims]
//!     u8  name[name_len]
//!     payload
//! }
//! ```
//!
//! Everything is little-endian.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use llama_engine::{LlamaError, Result};
use llama_tokenizer::Vocabulary;

use crate::hparams::HParams;
use crate::quant;
use crate::tensor::ElemType;

/// Magic of versioned files ("ggmf").
pub const MAGIC_VERSIONED: u32 = 0x6767_6d66;

/// Magic of legacy, unversioned files ("ggml").
pub const MAGIC_LEGACY: u32 = 0x6767_6d6c;

pub const FORMAT_VERSION: u32 = 1;

/// Longest tensor name accepted.
const MAX_NAME_LEN: usize = 4096;

/// Container revision of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVersion {
    /// "ggml": no version field, no scores, implicit block size.
    Legacy,
    /// "ggmf" version 1.
    V1,
}

impl FileVersion {
    pub fn has_scores(self) -> bool {
        self == FileVersion::V1
    }
}

/// A tensor record located inside a part file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRecord {
    pub name: String,
    pub shape: Vec<usize>,
    pub elem: ElemType,
    pub block_size: usize,
    /// Byte offset of the payload from the start of the file.
    pub offset: usize,
    /// Payload length in bytes.
    pub len: usize,
}

/// Turn short reads into format errors: a truncated file is malformed, not
/// an I/O failure.
fn truncated(what: &str) -> impl FnOnce(io::Error) -> LlamaError + '_ {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            LlamaError::Format(format!("unexpected end of file reading {what}"))
        } else {
            LlamaError::Io(e)
        }
    }
}

/// Read the magic, the version and the hyperparameters.
pub fn read_header<R: Read>(r: &mut R) -> Result<(FileVersion, HParams)> {
    let magic = r.read_u32::<LittleEndian>().map_err(truncated("magic"))?;
    let version = match magic {
        MAGIC_VERSIONED => {
            let v = r.read_u32::<LittleEndian>().map_err(truncated("version"))?;
            if v != FORMAT_VERSION {
                return Err(LlamaError::Format(format!(
                    "unsupported file version {v} (expected {FORMAT_VERSION})"
                )));
            }
            FileVersion::V1
        }
        MAGIC_LEGACY => FileVersion::Legacy,
        other => {
            return Err(LlamaError::Format(format!(
                "bad magic {other:#010x} (not a ggml/ggmf model file)"
            )))
        }
    };

    let mut raw = [0i32; 7];
    r.read_i32_into::<LittleEndian>(&mut raw)
        .map_err(truncated("hyperparameters"))?;
    Ok((version, HParams::from_raw(raw)?))
}

/// Read `n_vocab` vocabulary entries.
pub fn read_vocab<R: Read>(r: &mut R, version: FileVersion, n_vocab: usize) -> Result<Vocabulary> {
    let mut vocab = Vocabulary::with_capacity(n_vocab);
    for _ in 0..n_vocab {
        let len = r.read_u32::<LittleEndian>().map_err(truncated("token length"))? as usize;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        r.read_exact(&mut bytes).map_err(truncated("token bytes"))?;
        let score = if version.has_scores() {
            r.read_f32::<LittleEndian>().map_err(truncated("token score"))?
        } else {
            0.0
        };
        vocab.push(bytes, score);
    }
    Ok(vocab)
}

/// Read one tensor record and skip over its payload.
///
/// The payload is located, not copied; its bounds are checked against the
/// data held by the cursor.
pub fn read_tensor_record(cur: &mut Cursor<&[u8]>, version: FileVersion) -> Result<TensorRecord> {
    let n_dims = cur.read_i32::<LittleEndian>().map_err(truncated("tensor header"))?;
    let name_len = cur.read_i32::<LittleEndian>().map_err(truncated("tensor header"))?;
    let tag = cur.read_i32::<LittleEndian>().map_err(truncated("tensor header"))?;

    if !(1..=2).contains(&n_dims) {
        return Err(LlamaError::Format(format!("tensor has {n_dims} dimensions")));
    }
    let name_len = usize::try_from(name_len)
        .ok()
        .filter(|&n| n > 0 && n <= MAX_NAME_LEN)
        .ok_or_else(|| LlamaError::Format(format!("invalid tensor name length {name_len}")))?;
    let elem = ElemType::from_tag(tag)?;

    let block_size = match (elem.is_quantized(), version) {
        (true, FileVersion::V1) => {
            let bs = cur.read_i32::<LittleEndian>().map_err(truncated("block size"))?;
            let bs = usize::try_from(bs)
                .map_err(|_| LlamaError::Format(format!("invalid block size {bs}")))?;
            quant::validate_block_size(bs).map_err(|e| LlamaError::Format(e.to_string()))?;
            bs
        }
        _ => quant::LEGACY_BLOCK_SIZE,
    };

    let mut shape = Vec::with_capacity(n_dims as usize);
    for _ in 0..n_dims {
        let d = cur.read_i32::<LittleEndian>().map_err(truncated("tensor dims"))?;
        if d <= 0 {
            return Err(LlamaError::Format(format!("invalid tensor dimension {d}")));
        }
        shape.push(d as usize);
    }

    let mut name = vec![0u8; name_len];
    cur.read_exact(&mut name).map_err(truncated("tensor name"))?;
    let name = String::from_utf8(name)
        .map_err(|_| LlamaError::Format("tensor name is not valid UTF-8".into()))?;

    if elem.is_quantized() && shape[0] % block_size != 0 {
        return Err(LlamaError::Format(format!(
            "{name}: row length {} is not a multiple of block size {block_size}",
            shape[0]
        )));
    }
    let n_rows = shape.get(1).copied().unwrap_or(1);
    let len = quant::row_bytes(elem, shape[0], block_size)
        .checked_mul(n_rows)
        .ok_or_else(|| LlamaError::Format(format!("{name}: payload size overflows")))?;

    let offset = cur.position() as usize;
    let available = cur.get_ref().len().saturating_sub(offset);
    if len > available {
        return Err(LlamaError::Format(format!(
            "{name}: payload of {len} bytes truncated ({available} bytes left)"
        )));
    }
    cur.set_position((offset + len) as u64);

    Ok(TensorRecord {
        name,
        shape,
        elem,
        block_size,
        offset,
        len,
    })
}

/// Read every tensor record until end of data.
pub fn read_tensor_records(
    cur: &mut Cursor<&[u8]>,
    version: FileVersion,
) -> Result<Vec<TensorRecord>> {
    let mut records = Vec::new();
    while (cur.position() as usize) < cur.get_ref().len() {
        records.push(read_tensor_record(cur, version)?);
    }
    Ok(records)
}

/// Serializer for model files.
pub struct ModelWriter<W: Write> {
    inner: W,
    version: FileVersion,
}

impl<W: Write> ModelWriter<W> {
    pub fn new(inner: W, version: FileVersion) -> Self {
        Self { inner, version }
    }

    pub fn write_header(&mut self, hparams: &HParams) -> Result<()> {
        match self.version {
            FileVersion::V1 => {
                self.inner.write_u32::<LittleEndian>(MAGIC_VERSIONED)?;
                self.inner.write_u32::<LittleEndian>(FORMAT_VERSION)?;
            }
            FileVersion::Legacy => self.inner.write_u32::<LittleEndian>(MAGIC_LEGACY)?,
        }
        for v in hparams.to_raw() {
            self.inner.write_i32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    pub fn write_vocab(&mut self, vocab: &Vocabulary) -> Result<()> {
        for entry in vocab.iter() {
            self.inner.write_u32::<LittleEndian>(entry.bytes.len() as u32)?;
            self.inner.write_all(&entry.bytes)?;
            if self.version.has_scores() {
                self.inner.write_f32::<LittleEndian>(entry.score)?;
            }
        }
        Ok(())
    }

    /// Write a tensor header followed by its already-encoded payload.
    pub fn write_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        elem: ElemType,
        block_size: usize,
        payload: &[u8],
    ) -> Result<()> {
        if elem.is_quantized() && self.version == FileVersion::Legacy && block_size != quant::LEGACY_BLOCK_SIZE {
            return Err(LlamaError::InvalidArgument(format!(
                "legacy files only hold block size {}",
                quant::LEGACY_BLOCK_SIZE
            )));
        }
        self.inner.write_i32::<LittleEndian>(shape.len() as i32)?;
        self.inner.write_i32::<LittleEndian>(name.len() as i32)?;
        self.inner.write_i32::<LittleEndian>(elem.tag())?;
        if elem.is_quantized() && self.version == FileVersion::V1 {
            self.inner.write_i32::<LittleEndian>(block_size as i32)?;
        }
        for &d in shape {
            self.inner.write_i32::<LittleEndian>(d as i32)?;
        }
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(payload)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Little-endian f32 payload bytes.
pub fn f32_bytes(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4);
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hparams() -> HParams {
        HParams::from_raw([3, 8, 4, 2, 1, 4, 0]).unwrap()
    }

    fn vocab() -> Vocabulary {
        Vocabulary::from_entries([("<unk>", 0.0), ("a", -1.0), ("bc", -2.5)])
    }

    fn write_file(version: FileVersion) -> Vec<u8> {
        let mut w = ModelWriter::new(Vec::new(), version);
        w.write_header(&hparams()).unwrap();
        w.write_vocab(&vocab()).unwrap();
        w.write_tensor("norm.weight", &[8], ElemType::F32, 32, &f32_bytes(&[1.0; 8]))
            .unwrap();
        w.write_tensor("w", &[32, 2], ElemType::Q4_0, 32, &[0u8; 40])
            .unwrap();
        w.into_inner()
    }

    #[test]
    fn versioned_file_parses() {
        let bytes = write_file(FileVersion::V1);
        let mut cur = Cursor::new(&bytes[..]);
        let (version, h) = read_header(&mut cur).unwrap();
        assert_eq!(version, FileVersion::V1);
        assert_eq!(h, hparams());

        let v = read_vocab(&mut cur, version, h.n_vocab).unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v.score(2), Some(-2.5));
        assert_eq!(v.token_bytes(2), Some(&b"bc"[..]));

        let records = read_tensor_records(&mut cur, version).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "norm.weight");
        assert_eq!(records[0].len, 32);
        assert_eq!(records[1].elem, ElemType::Q4_0);
        assert_eq!(records[1].block_size, 32);
        assert_eq!(records[1].offset + records[1].len, bytes.len());
    }

    #[test]
    fn legacy_file_has_no_scores() {
        let bytes = write_file(FileVersion::Legacy);
        let mut cur = Cursor::new(&bytes[..]);
        let (version, h) = read_header(&mut cur).unwrap();
        assert_eq!(version, FileVersion::Legacy);
        let v = read_vocab(&mut cur, version, h.n_vocab).unwrap();
        assert_eq!(v.score(1), Some(0.0));
        let records = read_tensor_records(&mut cur, version).unwrap();
        assert_eq!(records[1].block_size, quant::LEGACY_BLOCK_SIZE);
    }

    #[test]
    fn bad_magic_and_version() {
        let mut cur = Cursor::new(&b"abcd\x01\x00\x00\x00"[..]);
        assert!(matches!(read_header(&mut cur), Err(LlamaError::Format(_))));

        let mut bytes = write_file(FileVersion::V1);
        bytes[4] = 2;
        let mut cur = Cursor::new(&bytes[..]);
        assert!(matches!(read_header(&mut cur), Err(LlamaError::Format(_))));
    }

    #[test]
    fn truncated_payload_is_format_error() {
        let bytes = write_file(FileVersion::V1);
        let cut = &bytes[..bytes.len() - 1];
        let mut cur = Cursor::new(cut);
        let (version, h) = read_header(&mut cur).unwrap();
        read_vocab(&mut cur, version, h.n_vocab).unwrap();
        assert!(matches!(
            read_tensor_records(&mut cur, version),
            Err(LlamaError::Format(_))
        ));
    }

    #[test]
    fn truncated_header_is_format_error() {
        let bytes = write_file(FileVersion::V1);
        let mut cur = Cursor::new(&bytes[..10]);
        assert!(matches!(read_header(&mut cur), Err(LlamaError::Format(_))));
    }

    #[test]
    fn legacy_writer_rejects_custom_block_size() {
        let mut w = ModelWriter::new(Vec::new(), FileVersion::Legacy);
        let err = w
            .write_tensor("w", &[16, 1], ElemType::Q4_0, 16, &[0u8; 12])
            .unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
    }
}
