use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use llama_cli::{generate_with, quantize, CliError, GenerateOptions};
use llama_engine::KvPrecision;
use llama_runtime::system_info;
use llama_sampling::SamplingParams;

/// llama.rs: CPU inference for LLaMA-family models
#[derive(Parser)]
#[command(name = "llama-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Quantize a model's weights to 4 bits.
    Quantize {
        /// Input model (f32, f16 or already quantized).
        input: PathBuf,

        /// Output model path.
        output: PathBuf,

        /// Target type: 2 or q4_0, 3 or q4_1.
        qtype: String,

        /// Values per quantization block (even, 2..=256).
        #[arg(long, default_value_t = 32)]
        block_size: usize,
    },

    /// Generate text from a prompt.
    Generate {
        /// Model path (first part when split).
        #[arg(short, long)]
        model: PathBuf,

        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate.
        #[arg(short = 'n', long, default_value_t = 128)]
        n_predict: usize,

        /// Context length.
        #[arg(short = 'c', long, default_value_t = 512)]
        ctx_size: usize,

        /// Worker threads (default: available parallelism, at most 8).
        #[arg(short, long)]
        threads: Option<usize>,

        /// RNG seed (default: time based).
        #[arg(short, long)]
        seed: Option<u64>,

        #[arg(long, default_value_t = 40)]
        top_k: i32,

        #[arg(long, default_value_t = 0.95)]
        top_p: f32,

        /// Sampling temperature; 0 is greedy.
        #[arg(long, default_value_t = 0.8)]
        temp: f32,

        #[arg(long, default_value_t = 1.1)]
        repeat_penalty: f32,

        /// Tokens considered by the repeat penalty.
        #[arg(long, default_value_t = 64)]
        repeat_last_n: usize,

        /// Keep the KV cache in f32 instead of f16.
        #[arg(long)]
        memory_f32: bool,

        /// Override the number of model parts.
        #[arg(long)]
        n_parts: Option<usize>,

        /// Pin the model in memory.
        #[arg(long)]
        mlock: bool,
    },

    /// Print compiled CPU features and available threads.
    SystemInfo,
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Quantize {
            input,
            output,
            qtype,
            block_size,
        } => {
            let report = quantize(&input, &output, &qtype, block_size)?;
            println!(
                "{} tensors, {} -> {} bytes",
                report.tensors.len(),
                report.original_bytes(),
                report.quantized_bytes()
            );
        }
        Command::Generate {
            model,
            prompt,
            n_predict,
            ctx_size,
            threads,
            seed,
            top_k,
            top_p,
            temp,
            repeat_penalty,
            repeat_last_n,
            memory_f32,
            n_parts,
            mlock,
        } => {
            let opts = GenerateOptions {
                n_predict,
                n_ctx: ctx_size,
                n_threads: threads.unwrap_or_else(|| system_info().threads.min(8)),
                seed,
                sampling: SamplingParams {
                    top_k,
                    top_p,
                    temperature: temp,
                    repeat_penalty,
                },
                repeat_last_n,
                kv_precision: if memory_f32 {
                    KvPrecision::F32
                } else {
                    KvPrecision::F16
                },
                n_parts,
                use_mlock: mlock,
                ..GenerateOptions::new(model, prompt)
            };
            tracing::info!(system_info = %system_info(), "starting");

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            generate_with(&opts, |piece| {
                // A closed stdout only loses output; generation carries on.
                let _ = out.write_all(piece).and_then(|()| out.flush());
            })?;
            let _ = writeln!(out);
        }
        Command::SystemInfo => println!("{}", system_info()),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command) {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}
