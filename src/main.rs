//! CLI for genai-oxidized: demo, stream, devices, config.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genai_oxidized::device::DeviceType;
use genai_oxidized::{
    runtime, ByteTokenizer, DemoEngineFactory, GenerationToken, Generator, GeneratorParams,
    HfTokenizer, Model, ModelConfig, StreamGenerator, Tokenizer,
};
use tracing::info;

/// Byte-level tokenizer specials: pad, bos, eos (the decoder config's defaults).
const SPECIAL_TOKENS: usize = 3;

#[derive(Parser)]
#[command(name = "genai-oxidized")]
#[command(about = "Token generation with constrained decoding")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct GenerateArgs {
    #[arg(long, default_value = "cpu")]
    device: DeviceType,
    #[arg(long, default_value = "Answer: ")]
    prompt: String,
    #[arg(long, default_value = "48")]
    max_length: usize,
    /// Constrain the output to a regular expression
    #[arg(long, conflicts_with = "choices")]
    regex: Option<String>,
    /// Constrain the output to one of these comma-separated strings
    #[arg(long)]
    choices: Option<String>,
    /// HuggingFace tokenizer.json instead of the byte-level tokenizer
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    #[arg(long)]
    graph_capture: bool,
    #[arg(long, default_value = "42")]
    seed: u64,
    #[arg(long)]
    sample: bool,
    #[arg(long, default_value = "1.0")]
    temperature: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate with the demo engine
    Demo(GenerateArgs),

    /// Generate with the demo engine, printing tokens as they arrive
    Stream(GenerateArgs),

    /// List device backends and their capabilities
    Devices,

    /// Validate a model config file and print its summary
    Config {
        #[arg(long)]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Demo(args) => run_demo(&args),
        Commands::Stream(args) => run_stream(&args),
        Commands::Devices => run_devices(),
        Commands::Config { path } => run_config(&path),
    };
    runtime::shutdown();
    result
}

fn build_generator(args: &GenerateArgs) -> Result<(Generator, Arc<dyn Tokenizer>)> {
    let tokenizer: Arc<dyn Tokenizer> = match &args.tokenizer {
        Some(path) => Arc::new(HfTokenizer::from_file(path)?),
        None => Arc::new(ByteTokenizer::new::<&[u8]>(SPECIAL_TOKENS, &[])),
    };

    let mut config = ModelConfig::decoder(tokenizer.vocab_size(), 2048);
    config.session_options.device = args.device;
    config.session_options.enable_graph_capture = args.graph_capture;
    let model = Arc::new(
        Model::new(config, DemoEngineFactory::seeded(args.seed))?
            .with_tokenizer(Arc::clone(&tokenizer)),
    );

    let mut params = GeneratorParams::new(&model);
    params.set_search_option("max_length", args.max_length as f64)?;
    params.set_search_option("random_seed", args.seed as f64)?;
    params.set_search_option("temperature", args.temperature)?;
    params.set_search_bool("do_sample", args.sample)?;
    if let Some(regex) = &args.regex {
        params.set_guidance("regex", regex.as_str());
    } else if let Some(choices) = &args.choices {
        let list: Vec<&str> = choices.split(',').map(str::trim).collect();
        params.set_guidance("choice", serde_json::to_string(&list)?);
    }
    if args.graph_capture && !params.try_graph_capture(1) {
        info!(device = %args.device, "graph capture unavailable; running uncaptured");
    }

    let mut generator = Generator::new(model, Arc::new(params))?;
    let prompt = tokenizer.encode(args.prompt.as_bytes())?;
    generator
        .append_tokens(&prompt)
        .context("prompt does not fit max_length")?;
    Ok((generator, tokenizer))
}

fn run_demo(args: &GenerateArgs) -> Result<()> {
    let (mut generator, tokenizer) = build_generator(args)?;
    let prompt_len = generator.sequence_length();
    let t0 = Instant::now();
    while !generator.is_done() {
        generator.generate_next_token()?;
    }
    let elapsed = t0.elapsed();

    let ids = generator.get_sequence(0)?.to_cpu();
    let generated = &ids[prompt_len..];
    info!(
        tokens = generated.len(),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "generation finished"
    );
    println!("Prompt:    {}", args.prompt);
    println!("Generated: {}", tokenizer.decode(generated)?);
    println!("Token ids: {:?}", generated);
    Ok(())
}

fn run_stream(args: &GenerateArgs) -> Result<()> {
    let (generator, _) = build_generator(args)?;
    let rt = tokio::runtime::Runtime::new().context("tokio runtime")?;
    rt.block_on(async move {
        let mut rx = StreamGenerator::new(generator).spawn();
        print!("{}", args.prompt);
        while let Some(event) = rx.recv().await {
            match event {
                GenerationToken::Token { text, id, .. } => {
                    print!("{}", text.unwrap_or_else(|| format!("<{}>", id)));
                }
                GenerationToken::Done {
                    total_tokens,
                    time_ms,
                } => {
                    println!();
                    info!(total_tokens, time_ms, "stream finished");
                }
                GenerationToken::Error(e) => anyhow::bail!("generation failed: {}", e),
            }
        }
        Ok(())
    })
}

fn run_devices() -> Result<()> {
    for device_type in DeviceType::ALL {
        let device = runtime::device(device_type)?;
        println!(
            "{:<8} graph_capture={:<5} continuous_decoding={:<5} peer_copy={}",
            device_type.as_str(),
            device.supports_graph_capture(),
            device.supports_continuous_decoding(),
            device.has_peer_copy()
        );
    }
    Ok(())
}

fn run_config(path: &std::path::Path) -> Result<()> {
    let config = ModelConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    println!("model_type:     {:?}", config.model_type);
    println!("vocab_size:     {}", config.vocab_size);
    println!("context_length: {}", config.context_length);
    println!("eos_token_id:   {:?}", config.eos_token_id.as_slice());
    println!("inputs:         {}", config.inputs.len());
    println!("max_length:     {}", config.search.max_length);
    println!(
        "graph_capture:  {} on {}",
        config.session_options.enable_graph_capture, config.session_options.device
    );
    Ok(())
}
