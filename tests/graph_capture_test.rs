//! Captured-graph decoding: when capture is granted, how slots are shared, and that
//! captured and uncaptured runs produce the same tokens.

use std::sync::Arc;

use genai_oxidized::device::{create_device, DeviceOptions, DeviceType};
use genai_oxidized::model::EngineLog;
use genai_oxidized::{
    DemoEngineFactory, EngineFactory, Generator, GeneratorParams, Model, ModelConfig,
    ScriptedEngineFactory,
};

const VOCAB: usize = 64;

fn model(device_type: DeviceType, capture: bool, factory: impl EngineFactory + 'static) -> Arc<Model> {
    let mut config = ModelConfig::decoder(VOCAB, 128);
    config.session_options.enable_graph_capture = capture;
    config.session_options.device = device_type;
    let device = create_device(device_type, &DeviceOptions::default());
    Arc::new(Model::with_device(config, factory, device).unwrap())
}

fn run(model: &Arc<Model>, batch_size: usize, max_batch_size: Option<usize>) -> (Vec<Vec<i32>>, bool) {
    let mut params = GeneratorParams::new(model);
    params.set_search_option("batch_size", batch_size as f64).unwrap();
    params.set_search_option("max_length", 12.0).unwrap();
    let captured = max_batch_size.map_or(false, |n| params.try_graph_capture(n));

    let mut gen = Generator::new(Arc::clone(model), Arc::new(params)).unwrap();
    let prompt: Vec<i32> = (0..batch_size as i32).flat_map(|b| [10 + b, 20 + b]).collect();
    gen.append_tokens(&prompt).unwrap();
    while !gen.is_done() {
        gen.generate_next_token().unwrap();
    }
    let rows = (0..gen.rows())
        .map(|r| gen.get_sequence(r).unwrap().to_cpu())
        .collect();
    (rows, captured)
}

#[test]
fn captured_decoding_matches_uncaptured() {
    let plain = model(DeviceType::Cuda, false, DemoEngineFactory::seeded(7));
    let captured = model(DeviceType::Cuda, true, DemoEngineFactory::seeded(7));

    let (expected, used) = run(&plain, 2, Some(4));
    assert!(!used);
    let (tokens, used) = run(&captured, 2, Some(4));
    assert!(used);
    assert_eq!(tokens, expected);
}

#[test]
fn prompt_runs_uncaptured_and_decode_steps_replay() {
    let factory = ScriptedEngineFactory::new(|ctx| 4 + ctx.last_token % 8);
    let log: EngineLog = factory.log();
    let m = model(DeviceType::Cuda, true, factory);
    let (tokens, used) = run(&m, 1, Some(1));
    assert!(used);
    assert_eq!(tokens[0][..5], [10, 20, 8, 4, 8]);

    let calls = log.calls();
    assert!(!calls[0].captured);
    assert_eq!(calls[0].new_tokens, 2);
    assert!(calls[1..].iter().all(|c| c.captured && c.new_tokens == 1));
}

#[test]
fn graph_slots_are_reused_across_generators() {
    let m = model(DeviceType::Cuda, true, DemoEngineFactory::seeded(3));
    run(&m, 1, Some(2));
    run(&m, 2, Some(2));
    assert_eq!(m.graph_pool().captures(), 1);
    run(&m, 1, Some(8));
    assert_eq!(m.graph_pool().captures(), 2);
    assert_eq!(m.graph_pool().largest_captured(), 8);
}

#[test]
fn oversized_batch_declines_capture() {
    let factory = ScriptedEngineFactory::new(|_| 5);
    let log = factory.log();
    let m = model(DeviceType::Cuda, true, factory);
    let (tokens, used) = run(&m, 8, Some(4));
    assert!(!used);
    assert_eq!(tokens.len(), 8);
    assert!(log.calls().iter().all(|c| !c.captured));
    assert_eq!(m.graph_pool().captures(), 0);
}

#[test]
fn capture_needs_backend_support_and_session_opt_in() {
    let cpu = model(DeviceType::Cpu, true, DemoEngineFactory::seeded(1));
    assert!(!run(&cpu, 1, Some(1)).1);

    let not_enabled = model(DeviceType::Dml, false, DemoEngineFactory::seeded(1));
    assert!(!run(&not_enabled, 1, Some(1)).1);

    let dml = model(DeviceType::Dml, true, DemoEngineFactory::seeded(1));
    assert!(run(&dml, 1, Some(1)).1);
}
