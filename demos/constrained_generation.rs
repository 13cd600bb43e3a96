//! Constrained generation: the same engine with and without a grammar.
//!
//! Demonstrates:
//! - Driving a Generator step by step with GenerateNextToken
//! - Regex and choice guidance
//! - Repetition penalty, sampling and rewinding a generator

use std::sync::Arc;

use anyhow::Result;
use genai_oxidized::{
    ByteTokenizer, DemoEngineFactory, Generator, GeneratorParams, Model, ModelConfig, Tokenizer,
};

fn run(model: &Arc<Model>, params: GeneratorParams, prompt: &str) -> Result<String> {
    let tok = Arc::clone(model.tokenizer().ok_or_else(|| anyhow::anyhow!("no tokenizer"))?);
    let mut gen = Generator::new(Arc::clone(model), Arc::new(params))?;
    let ids = tok.encode(prompt.as_bytes())?;
    gen.append_tokens(&ids)?;
    while !gen.is_done() {
        gen.generate_next_token()?;
    }
    let seq = gen.get_sequence(0)?.to_cpu();
    Ok(tok.decode(&seq[ids.len()..])?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let tok = Arc::new(ByteTokenizer::new(3, &["the", "ing", "er", "yes", "no"]));
    let model = Arc::new(
        Model::new(ModelConfig::decoder(tok.vocab_size(), 256), DemoEngineFactory::seeded(7))?
            .with_tokenizer(tok.clone()),
    );

    // Unconstrained: random bytes from the demo engine.
    let mut params = GeneratorParams::new(&model);
    params.set_search_option("max_length", 24.0)?;
    println!("free:    {:?}", run(&model, params, "Q: ")?);

    // Date-shaped output.
    let mut params = GeneratorParams::new(&model);
    params.set_search_option("max_length", 48.0)?;
    params.set_guidance("regex", r"20[0-9]{2}-(0[1-9]|1[0-2])-[0-2][0-9]");
    println!("regex:   {:?}", run(&model, params, "date: ")?);

    // One of a fixed set, sampled.
    let mut params = GeneratorParams::new(&model);
    params.set_search_option("max_length", 48.0)?;
    params.set_search_bool("do_sample", true)?;
    params.set_search_option("random_seed", 3.0)?;
    params.set_search_option("repetition_penalty", 1.3)?;
    params.set_guidance("choice", r#"["yes", "no", "not sure"]"#);
    println!("choice:  {:?}", run(&model, params, "ok? ")?);

    // Rewind and continue from a shorter prefix.
    let mut params = GeneratorParams::new(&model);
    params.set_search_option("max_length", 32.0)?;
    let mut gen = Generator::new(Arc::clone(&model), Arc::new(params))?;
    gen.append_tokens(&tok.encode(b"abc")?)?;
    while !gen.is_done() && gen.sequence_length() < 7 {
        gen.generate_next_token()?;
    }
    let before = gen.get_sequence(0)?.to_cpu();
    gen.rewind_to_length(3)?;
    gen.generate_next_token()?;
    let after = gen.get_sequence(0)?.to_cpu();
    println!("rewind:  {:?} -> {:?}", before, after);
    Ok(())
}
