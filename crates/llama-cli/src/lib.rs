//! # llama-cli
//!
//! Command implementations behind the `llama-cli` binary.
//!
//! - `quantize`: re-encode a model's 2-D weights as Q4_0 / Q4_1
//! - `generate`: tokenizer → eval → sampler loop over a model file
//! - `system-info`: compiled CPU features and available threads

use std::path::{Path, PathBuf};

use llama_engine::{ContextParams, KvPrecision, LlamaError, StatusCode, TokenId, TOKEN_EOS};
use llama_models::QuantizeReport;
use llama_runtime::{Context, TimingReport};
use llama_sampling::SamplingParams;

/// Errors surfaced by the CLI commands.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Llama(#[from] LlamaError),
    #[error("empty prompt")]
    EmptyPrompt,
    #[error("unknown quantization type {0:?} (expected 2, 3, q4_0 or q4_1)")]
    UnknownType(String),
}

impl CliError {
    /// Process exit code: the status code of the underlying failure.
    pub fn exit_code(&self) -> i32 {
        let status = match self {
            CliError::Llama(e) => e.status(),
            CliError::EmptyPrompt => StatusCode::InvalidArgument,
            CliError::UnknownType(_) => StatusCode::UnsupportedType,
        };
        status.code()
    }
}

/// Accepts `2`, `3`, `q4_0` or `q4_1`. Other integers are passed through
/// for the quantizer to reject.
pub fn parse_quant_type(s: &str) -> Result<i32, CliError> {
    match s.to_ascii_lowercase().as_str() {
        "q4_0" => Ok(2),
        "q4_1" => Ok(3),
        other => other
            .parse::<i32>()
            .map_err(|_| CliError::UnknownType(s.to_string())),
    }
}

pub fn quantize(
    input: &Path,
    output: &Path,
    qtype: &str,
    block_size: usize,
) -> Result<QuantizeReport, CliError> {
    let itype = parse_quant_type(qtype)?;
    let report = llama_models::quantize(input, output, itype, block_size)?;
    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        original_mb = report.original_bytes() as f64 / (1024.0 * 1024.0),
        quantized_mb = report.quantized_bytes() as f64 / (1024.0 * 1024.0),
        "quantized"
    );
    Ok(report)
}

/// Options of one `generate` run.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: PathBuf,
    pub prompt: String,
    /// Maximum number of tokens to generate.
    pub n_predict: usize,
    pub n_ctx: usize,
    pub n_threads: usize,
    /// `None` seeds from the clock.
    pub seed: Option<u64>,
    pub sampling: SamplingParams,
    /// How many of the latest tokens the repeat penalty looks at.
    pub repeat_last_n: usize,
    pub kv_precision: KvPrecision,
    pub n_parts: Option<usize>,
    pub use_mlock: bool,
}

impl GenerateOptions {
    pub fn new(model: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            n_predict: 128,
            n_ctx: 512,
            n_threads: 4,
            seed: None,
            sampling: SamplingParams::default(),
            repeat_last_n: 64,
            kv_precision: KvPrecision::F16,
            n_parts: None,
            use_mlock: false,
        }
    }

    fn context_params(&self) -> Result<ContextParams, LlamaError> {
        let mut builder = ContextParams::builder()
            .n_ctx(self.n_ctx)
            .kv_precision(self.kv_precision)
            .use_mlock(self.use_mlock);
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        if let Some(n_parts) = self.n_parts {
            builder = builder.n_parts(n_parts);
        }
        builder.build()
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Prompt tokens, BOS included.
    pub prompt_tokens: Vec<TokenId>,
    /// Newly generated tokens.
    pub tokens: Vec<TokenId>,
    /// Decoded text of the new tokens.
    pub text: String,
    pub timings: TimingReport,
}

/// Run the generation loop, handing each new token's bytes to `on_piece`.
///
/// Stops after `n_predict` tokens, on end-of-sequence, or when the context
/// is full.
pub fn generate_with<F>(opts: &GenerateOptions, mut on_piece: F) -> Result<GenerateResult, CliError>
where
    F: FnMut(&[u8]),
{
    if opts.prompt.is_empty() {
        return Err(CliError::EmptyPrompt);
    }
    let mut ctx = Context::init(&opts.model, opts.context_params()?)?;

    let prompt_tokens = ctx.tokenize(&opts.prompt, true)?;
    tracing::info!(n_prompt = prompt_tokens.len(), "prompt tokenized");
    ctx.eval(&prompt_tokens, 0, opts.n_threads)?;

    let mut history = prompt_tokens.clone();
    let mut tokens = Vec::new();
    while tokens.len() < opts.n_predict {
        let recent = &history[history.len().saturating_sub(opts.repeat_last_n)..];
        let next = ctx.sample(recent, &opts.sampling)?;
        if next == TOKEN_EOS {
            tracing::debug!("end of sequence");
            break;
        }
        if let Some(bytes) = ctx.token_bytes(next) {
            on_piece(bytes);
        }
        tokens.push(next);
        history.push(next);
        if ctx.n_past() >= ctx.n_ctx() {
            tracing::warn!(n_ctx = ctx.n_ctx(), "context full, stopping");
            break;
        }
        ctx.eval(&[next], ctx.n_past(), opts.n_threads)?;
    }

    let text = ctx.detokenize(&tokens)?;
    ctx.print_timings();
    Ok(GenerateResult {
        prompt_tokens,
        tokens,
        text,
        timings: ctx.timings(),
    })
}

pub fn generate(opts: &GenerateOptions) -> Result<GenerateResult, CliError> {
    generate_with(opts, |_| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_models::fixture::{self, FixtureConfig};

    fn tiny_model() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.bin");
        fixture::write_model(&path, &FixtureConfig::tiny()).unwrap();
        (dir, path)
    }

    fn opts(path: &Path, seed: u64) -> GenerateOptions {
        GenerateOptions {
            n_predict: 6,
            n_ctx: 32,
            n_threads: 2,
            seed: Some(seed),
            ..GenerateOptions::new(path, " the cat")
        }
    }

    #[test]
    fn generate_deterministic_with_seed() {
        let (_dir, path) = tiny_model();
        let a = generate(&opts(&path, 42)).unwrap();
        let b = generate(&opts(&path, 42)).unwrap();
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.text, b.text);
        assert_eq!(a.prompt_tokens[0], 1);
    }

    #[test]
    fn generate_respects_n_predict() {
        let (_dir, path) = tiny_model();
        let result = generate(&opts(&path, 3)).unwrap();
        assert!(result.tokens.len() <= 6);
        assert!(!result.tokens.contains(&TOKEN_EOS));
        // one extra draw when the run ended on end-of-sequence
        let ended_early = usize::from(result.tokens.len() < 6);
        assert_eq!(result.timings.sample_count, result.tokens.len() + ended_early);
    }

    #[test]
    fn streamed_pieces_match_text() {
        let (_dir, path) = tiny_model();
        let mut streamed = Vec::new();
        let result = generate_with(&opts(&path, 5), |piece| streamed.extend_from_slice(piece)).unwrap();
        assert_eq!(String::from_utf8_lossy(&streamed), result.text);
    }

    #[test]
    fn generate_stops_when_context_is_full() {
        let (_dir, path) = tiny_model();
        let mut o = opts(&path, 9);
        o.n_ctx = 5;
        o.n_predict = 100;
        o.sampling.temperature = 0.0;
        let result = generate(&o).unwrap();
        assert!(result.prompt_tokens.len() + result.tokens.len() <= 6);
    }

    #[test]
    fn generate_empty_prompt_errors() {
        let (_dir, path) = tiny_model();
        let err = generate(&GenerateOptions::new(&path, "")).unwrap_err();
        assert!(matches!(err, CliError::EmptyPrompt));
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn missing_model_is_io_error() {
        let err = generate(&GenerateOptions::new("/nonexistent/model.bin", "hi")).unwrap_err();
        assert_eq!(err.exit_code(), StatusCode::Io.code());
    }

    #[test]
    fn quant_type_names() {
        assert_eq!(parse_quant_type("2").unwrap(), 2);
        assert_eq!(parse_quant_type("q4_1").unwrap(), 3);
        assert_eq!(parse_quant_type("Q4_0").unwrap(), 2);
        assert_eq!(parse_quant_type("7").unwrap(), 7);
        let err = parse_quant_type("q8_0").unwrap_err();
        assert_eq!(err.exit_code(), StatusCode::UnsupportedType.code());
    }

    #[test]
    fn quantize_command_writes_output() {
        let (dir, path) = tiny_model();
        let out = dir.path().join("q4_0.bin");
        let report = quantize(&path, &out, "q4_0", 32).unwrap();
        assert!(out.exists());
        assert!(report.quantized_bytes() < report.original_bytes());

        let err = quantize(&path, &dir.path().join("x.bin"), "1", 32).unwrap_err();
        assert_eq!(err.exit_code(), StatusCode::UnsupportedType.code());
    }
}
