//! # llama-engine
//!
//! The "narrow waist" of the llama.rs stack. Defines the token type, the
//! error taxonomy shared by every crate, the status codes surfaced at the
//! evaluation boundary, and the immutable [`ContextParams`] configuration.
//!
//! ## Design Notes
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` to match the on-disk format and the
//! sentinel-returning tokenizer API (negative counts). Valid ids are
//! `[0, n_vocab)`.
//!
//! ### Errors
//! Component crates keep their own error enums (`KVError`, `SamplingError`,
//! `TokenizerError`) and convert into [`LlamaError`] at crate boundaries.
//! Every [`LlamaError`] maps onto exactly one [`StatusCode`].

pub mod config;
pub mod progress;

pub use config::{ContextParams, ContextParamsBuilder, KvPrecision};
pub use progress::{LoadProgress, NoProgress};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 to match the file format; logically non-negative).
pub type TokenId = i32;

/// Beginning-of-sequence token. Fixed, not learned from the vocabulary.
pub const TOKEN_BOS: TokenId = 1;

/// End-of-sequence token. Fixed, not learned from the vocabulary.
pub const TOKEN_EOS: TokenId = 2;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    /// Bad magic, unsupported version, malformed or inconsistent model data.
    #[error("format error: {0}")]
    Format(String),

    /// File missing, unreadable or unwritable.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown quantization type requested.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// `n_past + n_tokens` would exceed the context length.
    #[error("context overflow: n_past {n_past} + {n_tokens} tokens > n_ctx {n_ctx}")]
    ContextOverflow {
        n_past: usize,
        n_tokens: usize,
        n_ctx: usize,
    },

    /// Caller-provided output buffer is too small; `required` is exact.
    #[error("buffer too small: {required} slots required, {capacity} available")]
    BufferTooSmall { required: usize, capacity: usize },

    /// Resource exhaustion while loading or allocating caches.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A call violated its preconditions (bad token id, zero threads, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LlamaError {
    /// Discriminated status for callers that consume sentinel values.
    pub fn status(&self) -> StatusCode {
        match self {
            LlamaError::Format(_) => StatusCode::Format,
            LlamaError::Io(_) => StatusCode::Io,
            LlamaError::UnsupportedType(_) => StatusCode::UnsupportedType,
            LlamaError::ContextOverflow { .. } => StatusCode::ContextOverflow,
            LlamaError::BufferTooSmall { .. } => StatusCode::BufferTooSmall,
            LlamaError::Allocation(_) => StatusCode::Allocation,
            LlamaError::InvalidArgument(_) => StatusCode::InvalidArgument,
        }
    }

    /// Whether the caller can recover without discarding the Model/Context.
    ///
    /// Overflow is recovered by truncating context, a short buffer by
    /// reallocating to the reported size.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LlamaError::ContextOverflow { .. }
                | LlamaError::BufferTooSmall { .. }
                | LlamaError::InvalidArgument(_)
        )
    }
}

impl From<std::collections::TryReserveError> for LlamaError {
    fn from(e: std::collections::TryReserveError) -> Self {
        LlamaError::Allocation(e.to_string())
    }
}

/// Status codes returned across the evaluation boundary. `0` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Format = 1,
    Io = 2,
    UnsupportedType = 3,
    ContextOverflow = 4,
    BufferTooSmall = 5,
    Allocation = 6,
    InvalidArgument = 7,
}

impl StatusCode {
    /// Collapse a result into its status code.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(e) => e.status(),
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "ok",
            StatusCode::Format => "format",
            StatusCode::Io => "io",
            StatusCode::UnsupportedType => "unsupported_type",
            StatusCode::ContextOverflow => "context_overflow",
            StatusCode::BufferTooSmall => "buffer_too_small",
            StatusCode::Allocation => "allocation",
            StatusCode::InvalidArgument => "invalid_argument",
        };
        write!(f, "{name}")
    }
}
