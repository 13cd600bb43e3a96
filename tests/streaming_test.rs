//! Streaming generation over a tokio channel.

use std::sync::Arc;

use genai_oxidized::device::{create_device, DeviceOptions, DeviceType};
use genai_oxidized::{
    ByteTokenizer, GenerationToken, Generator, GeneratorParams, Model, ModelConfig,
    ScriptedEngineFactory, Tokenizer,
};

fn generator(factory: ScriptedEngineFactory, batch_size: usize) -> Generator {
    let tok = Arc::new(ByteTokenizer::new::<&str>(3, &[]));
    let device = create_device(DeviceType::Cpu, &DeviceOptions::default());
    let model = Arc::new(
        Model::with_device(ModelConfig::decoder(tok.vocab_size(), 64), factory, device)
            .unwrap()
            .with_tokenizer(tok),
    );
    let mut params = GeneratorParams::new(&model);
    params.set_search_option("batch_size", batch_size as f64).unwrap();
    params.set_search_option("max_length", 8.0).unwrap();
    let mut gen = Generator::new(model, Arc::new(params)).unwrap();
    gen.append_tokens(&vec![3 + b'>' as i32; batch_size]).unwrap();
    gen
}

#[tokio::test]
async fn streams_tokens_then_done() {
    // "hi" then eos.
    let factory = ScriptedEngineFactory::new(|ctx| match ctx.call {
        1 => 3 + b'h' as i32,
        2 => 3 + b'i' as i32,
        _ => 2,
    });
    let mut rx = genai_oxidized::StreamGenerator::new(generator(factory, 1)).spawn();

    let mut text = String::new();
    let mut ids = Vec::new();
    let mut done = None;
    while let Some(event) = rx.recv().await {
        match event {
            GenerationToken::Token { row, id, text: t } => {
                assert_eq!(row, 0);
                ids.push(id);
                text.push_str(&t.unwrap_or_default());
            }
            GenerationToken::Done { total_tokens, .. } => done = Some(total_tokens),
            GenerationToken::Error(e) => panic!("stream failed: {}", e),
        }
    }
    assert_eq!(text, "hi");
    assert_eq!(ids.last(), Some(&2));
    assert_eq!(done, Some(3));
}

#[tokio::test]
async fn finished_rows_stop_streaming() {
    let factory = ScriptedEngineFactory::new(|ctx| if ctx.row == 1 { 2 } else { 3 + b'x' as i32 });
    let mut rx = genai_oxidized::StreamGenerator::new(generator(factory, 2))
        .with_capacity(4)
        .spawn();

    let mut per_row = [0usize; 2];
    while let Some(event) = rx.recv().await {
        if let GenerationToken::Token { row, .. } = event {
            per_row[row] += 1;
        }
    }
    // Row 0 runs to max_length; row 1 stops after its eos.
    assert_eq!(per_row, [7, 1]);
}

#[tokio::test]
async fn engine_errors_are_reported_on_the_stream() {
    let factory = ScriptedEngineFactory::new(|_| 3 + b'a' as i32).failing_on_call(2);
    let mut rx = genai_oxidized::StreamGenerator::new(generator(factory, 1)).spawn();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], GenerationToken::Token { .. }));
    assert!(matches!(&events[1], GenerationToken::Error(msg) if msg.contains("scripted failure")));
}
