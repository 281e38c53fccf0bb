//! # llama-models
//!
//! Model files on disk and weights in memory.
//!
//! Provides:
//! - **Format**: reader and writer for versioned ("ggmf") and legacy
//!   ("ggml") model files
//! - **Tensor store**: typed, bounds-checked access to f32, f16, Q4_0 and
//!   Q4_1 payloads, served zero-copy from memory-mapped files
//! - **Loader**: tensor set validation and merging of split checkpoints
//! - **Quantizer**: offline re-encoding to 4-bit block formats
//! - **Fixtures**: deterministic synthetic models for tests

pub mod fixture;
pub mod format;
pub mod hparams;
pub mod loader;
pub mod mmap;
pub mod quant;
pub mod quantize;
pub mod tensor;

pub use format::FileVersion;
pub use hparams::HParams;
pub use loader::{expected_tensors, part_path, LayerWeights, Model, ModelWeights};
pub use mmap::MappedFile;
pub use quantize::{quantize, QuantizeReport, TensorReport};
pub use tensor::{ElemType, Payload, SplitAxis, Tensor};
