//! Criterion benchmarks for the logits mask merge and guided decoding steps.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use genai_oxidized::device::{create_device, DeviceOptions, DeviceType};
use genai_oxidized::kernels::{apply_token_mask, TokenMask};
use genai_oxidized::{
    ByteTokenizer, DemoEngineFactory, Generator, GeneratorParams, Model, ModelConfig, Tokenizer,
};
use rand::Rng;

const VOCAB: usize = 32_000;

fn make_case(rows: usize) -> (Vec<f32>, Vec<u32>) {
    let mut rng = rand::thread_rng();
    let logits: Vec<f32> = (0..rows * VOCAB).map(|_| rng.gen_range(-8.0..8.0)).collect();
    let words = (0..rows)
        .flat_map(|_| {
            let allowed = (0..VOCAB as u32).filter(|_| rng.gen_bool(0.1)).collect::<Vec<_>>();
            TokenMask::from_allowed(VOCAB, allowed).words().to_vec()
        })
        .collect();
    (logits, words)
}

fn bench_host_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask_merge_host");
    for rows in [1usize, 8] {
        let (logits, words) = make_case(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                let mut scores = logits.clone();
                apply_token_mask(black_box(&mut scores), black_box(&words), VOCAB);
                scores
            })
        });
    }
    group.finish();
}

fn bench_device_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask_merge_device");
    let (logits, words) = make_case(4);
    for device_type in [DeviceType::Cpu, DeviceType::Cuda] {
        let device = create_device(device_type, &DeviceOptions::default());
        let span = device.upload(&logits).unwrap();
        let mask = device.upload(&words).unwrap();
        group.bench_function(device_type.as_str(), |b| {
            b.iter(|| {
                span.copy_from_cpu(&logits).unwrap();
                device.apply_mask(&span, &mask, VOCAB).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_guided_generation(c: &mut Criterion) {
    let tok = Arc::new(ByteTokenizer::new(3, &["the", "ing", "er", "12", "00"]));
    let model = Arc::new(
        Model::new(
            ModelConfig::decoder(tok.vocab_size(), 256),
            DemoEngineFactory::seeded(5),
        )
        .unwrap()
        .with_tokenizer(tok.clone()),
    );
    let prompt = tok.encode(b"value: ").unwrap();

    c.bench_function("guided_generation_regex", |b| {
        b.iter(|| {
            let mut params = GeneratorParams::new(&model);
            params.set_search_option("max_length", 48.0).unwrap();
            params.set_guidance("regex", "[0-9]{1,6}\\.[0-9]{2}");
            let mut gen = Generator::new(Arc::clone(&model), Arc::new(params)).unwrap();
            gen.append_tokens(&prompt).unwrap();
            while !gen.is_done() {
                gen.generate_next_token().unwrap();
            }
            black_box(gen.sequence_length())
        })
    });
}

criterion_group!(benches, bench_host_merge, bench_device_merge, bench_guided_generation);
criterion_main!(benches);
