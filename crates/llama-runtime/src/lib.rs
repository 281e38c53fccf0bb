//! # llama-runtime
//!
//! Evaluation for llama.rs: the [`Context`] session API, the transformer
//! forward pass, the worker pool that partitions its matrix products, and
//! per-context timings.
//!
//! ```no_run
//! use llama_engine::ContextParams;
//! use llama_runtime::Context;
//!
//! let params = ContextParams::builder().n_ctx(512).seed(42).build()?;
//! let mut ctx = Context::init("models/7B/ggml-model-q4_0.bin", params)?;
//! let tokens = ctx.tokenize(" Hello", true)?;
//! ctx.eval(&tokens, 0, 4)?;
//! let next = ctx.sample_top_p_top_k(&tokens, 40, 0.95, 0.8, 1.1)?;
//! # Ok::<(), llama_engine::LlamaError>(())
//! ```

pub mod context;
pub mod forward;
pub mod pool;
pub mod system;
pub mod timings;

use llama_engine::{TokenId, TOKEN_BOS, TOKEN_EOS};

pub use context::Context;
pub use forward::{ForwardOutput, RmsNorm, Rope, Scratch, Transformer};
pub use pool::WorkerPool;
pub use system::{system_info, SystemInfo};
pub use timings::{TimingReport, Timings};

pub fn token_bos() -> TokenId {
    TOKEN_BOS
}

pub fn token_eos() -> TokenId {
    TOKEN_EOS
}
