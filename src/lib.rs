//! # llama
//!
//! CPU inference for LLaMA-family models stored in the `ggmf` binary format.
//!
//! This crate is a facade over the workspace:
//!
//! | Crate | Role |
//! |---|---|
//! | `llama-engine` | token type, errors, status codes, [`ContextParams`] |
//! | `llama-tokenizer` | vocabulary and score-driven merge tokenizer |
//! | `llama-models` | file format, loader, 4-bit quantizer |
//! | `llama-kv` | per-layer key/value cache |
//! | `llama-sampling` | repetition penalty, temperature, top-k, top-p |
//! | `llama-runtime` | forward pass, worker pool, [`Context`] |
//!
//! ```no_run
//! use llama::{Context, ContextParams, SamplingParams};
//!
//! let params = ContextParams::builder().n_ctx(512).seed(1).build()?;
//! let mut ctx = Context::init("models/7B/ggml-model-q4_0.bin", params)?;
//! let mut tokens = ctx.tokenize(" Building a website", true)?;
//! ctx.eval(&tokens, 0, 4)?;
//! let next = ctx.sample(&tokens, &SamplingParams::default())?;
//! tokens.push(next);
//! # Ok::<(), llama::LlamaError>(())
//! ```

pub use llama_engine::{
    ContextParams, ContextParamsBuilder, KvPrecision, LlamaError, LoadProgress, NoProgress,
    Result, StatusCode, TokenId, TOKEN_BOS, TOKEN_EOS,
};
pub use llama_kv::{KVError, KVShape, SessionKVCache};
pub use llama_models::{quantize, ElemType, FileVersion, HParams, Model, QuantizeReport};
pub use llama_runtime::{
    system_info, token_bos, token_eos, Context, SystemInfo, TimingReport,
};
pub use llama_sampling::{sample, Sampler, SamplingError, SamplingParams, SeededRng};
pub use llama_tokenizer::{SpmTokenizer, Tokenizer, Vocabulary};

/// Component crates, for APIs not re-exported at the top level.
pub mod engine {
    pub use llama_engine::*;
}

pub mod models {
    pub use llama_models::*;
}

pub mod runtime {
    pub use llama_runtime::*;
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
