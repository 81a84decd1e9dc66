//! strata-chat: Chat with a local GGUF model, reusing the cached prompt
//! between turns.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use serde::Serialize;

use strata_chat::backend::llama_cpp::LlamaCppLoader;
use strata_chat::cli;
use strata_chat::{
    GenerationOutput, NullSink, SamplingParams, SessionConfig, SessionHandle, SessionRegistry,
};

#[derive(Parser)]
#[command(name = "strata-chat", about = "Chat with a GGUF model")]
struct Args {
    /// Path to GGUF model file
    #[arg(short = 'm', long)]
    model: PathBuf,

    /// JSON session configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Single-shot prompt (omit for interactive mode)
    #[arg(short = 'p', long, conflicts_with = "file")]
    prompt: Option<String>,

    /// Read a single-shot prompt from file
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Restore a saved conversation before the first turn
    #[arg(long)]
    history: Option<PathBuf>,

    /// Save the conversation here on exit
    #[arg(long)]
    save_history: Option<PathBuf>,

    /// System prompt
    #[arg(long)]
    system: Option<String>,

    /// Context window size in tokens
    #[arg(short = 'c', long)]
    ctx: Option<usize>,

    /// CPU threads
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Maximum tokens to generate per turn
    #[arg(short = 'n', long)]
    max_tokens: Option<usize>,

    /// Temperature (0.0 = greedy)
    #[arg(long)]
    temp: Option<f32>,

    /// Top-k sampling (0 = disabled)
    #[arg(long)]
    top_k: Option<usize>,

    /// Top-p (nucleus) sampling
    #[arg(long)]
    top_p: Option<f32>,

    /// Min-p sampling (0.0 = disabled)
    #[arg(long)]
    min_p: Option<f32>,

    /// Random seed for sampling
    #[arg(short = 's', long)]
    seed: Option<u64>,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!(
            "Unknown output format '{}'. Options: text, json",
            s
        )),
    }
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    model: String,
    prompt: &'a str,
    output: &'a str,
    prompt_tokens: usize,
    prefill_tokens: usize,
    generated_tokens: usize,
    stop_reason: String,
    elapsed_ms: f64,
    tokens_per_second: f64,
    sampling: &'a SamplingParams,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(ctx) = args.ctx {
        config.context_size = ctx;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_new_tokens = max_tokens;
    }
    if let Some(system) = &args.system {
        config.system_prompt = Some(system.clone());
    }

    let sampling = &mut config.sampling;
    if let Some(temp) = args.temp {
        sampling.temperature = temp;
    }
    if let Some(top_k) = args.top_k {
        sampling.top_k = top_k;
    }
    if let Some(top_p) = args.top_p {
        sampling.top_p = top_p;
    }
    if let Some(min_p) = args.min_p {
        sampling.min_p = min_p;
    }
    if args.seed.is_some() {
        sampling.seed = args.seed;
    }

    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let sampling = config.sampling.clone();
    let single_shot = cli::read_prompt(args.prompt.as_deref(), args.file.as_deref())?;

    let registry = SessionRegistry::new(LlamaCppLoader);
    let handle = registry.init_with_config(&args.model, config)?;

    if let Some(path) = &args.history {
        let entries = cli::load_history(path)?;
        registry.restore_history(handle, &entries)?;
        eprintln!("Restored {} messages from {}", entries.len(), path.display());
    }

    let result = match single_shot {
        Some(prompt) => single_turn(&registry, handle, &args, &prompt, &sampling),
        None => interactive(&registry, handle, &sampling),
    };

    if let Some(path) = &args.save_history {
        cli::save_history(path, &registry.history(handle)?)?;
    }
    registry.free(handle);
    result
}

fn single_turn(
    registry: &SessionRegistry<LlamaCppLoader>,
    handle: SessionHandle,
    args: &Args,
    prompt: &str,
    sampling: &SamplingParams,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.output_format == "json" {
        let output = registry.predict_streaming(handle, prompt, sampling, &mut NullSink)?;
        let json = JsonOutput {
            model: args.model.display().to_string(),
            prompt,
            output: &output.text,
            prompt_tokens: output.prompt_tokens,
            prefill_tokens: output.prefill_tokens,
            generated_tokens: output.token_ids.len(),
            stop_reason: output.stop_reason.to_string(),
            elapsed_ms: output.elapsed.as_secs_f64() * 1000.0,
            tokens_per_second: output.tokens_per_second(),
            sampling,
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let output = stream_turn(registry, handle, prompt, sampling)?;
    print_stats(&output);
    Ok(())
}

fn interactive(
    registry: &SessionRegistry<LlamaCppLoader>,
    handle: SessionHandle,
    sampling: &SamplingParams,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Type a message and press Enter. /quit to exit.");
    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        eprint!("> ");
        std::io::stderr().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim_end_matches(['\r', '\n']);
        if prompt == "/quit" || prompt == "/exit" {
            break;
        }

        match stream_turn(registry, handle, prompt, sampling) {
            Ok(output) => print_stats(&output),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    Ok(())
}

fn stream_turn(
    registry: &SessionRegistry<LlamaCppLoader>,
    handle: SessionHandle,
    prompt: &str,
    sampling: &SamplingParams,
) -> Result<GenerationOutput, Box<dyn std::error::Error>> {
    let mut sink = cli::StreamSink::new(std::io::stdout().lock());
    let output = registry.predict_streaming(handle, prompt, sampling, &mut sink)?;
    if let Some(e) = sink.take_error() {
        return Err(e.into());
    }
    Ok(output)
}

fn print_stats(output: &GenerationOutput) {
    eprintln!(
        "[{} tokens, {:.2} tokens/s, stop: {}]",
        output.token_ids.len(),
        output.tokens_per_second(),
        output.stop_reason
    );
}
