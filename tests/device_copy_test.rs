//! Device buffers: cross-device copies of every size class and the mask merge on each
//! backend against a host reference.

use genai_oxidized::device::{copy_through_host, create_device, DeviceOptions, DeviceType};
use genai_oxidized::kernels::{apply_token_mask, TokenMask};
use proptest::prelude::*;

#[test]
fn copies_between_devices_for_all_sizes() {
    let cpu = create_device(DeviceType::Cpu, &DeviceOptions::default());
    let cuda = create_device(DeviceType::Cuda, &DeviceOptions::default());
    for n in [0usize, 1, 4096] {
        let data: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
        let src = cpu.upload(&data).unwrap();
        let dst = cuda.allocate::<f32>(n).unwrap();
        cuda.copy(&dst, 0, &src, 0, n * 4).unwrap();
        assert_eq!(dst.to_cpu(), data, "size {}", n);

        let back = cpu.allocate::<f32>(n).unwrap();
        copy_through_host(&back, 0, &dst, 0, n * 4).unwrap();
        assert_eq!(back.to_cpu(), data);
    }
}

#[test]
fn copy_reinterprets_bytes_across_element_types() {
    let cuda = create_device(DeviceType::Cuda, &DeviceOptions::default());
    let bits = cuda.upload(&[1.0f32.to_bits(), (-2.5f32).to_bits()]).unwrap();
    let floats = cuda.allocate::<f32>(2).unwrap();
    cuda.copy(&floats, 0, &bits, 0, 8).unwrap();
    assert_eq!(floats.to_cpu(), vec![1.0, -2.5]);
}

#[test]
fn copy_outside_either_span_fails() {
    let cpu = create_device(DeviceType::Cpu, &DeviceOptions::default());
    let src = cpu.upload(&[1i32, 2, 3]).unwrap();
    let dst = cpu.allocate::<i32>(2).unwrap();
    assert!(cpu.copy(&dst, 0, &src, 0, 12).is_err());
    assert!(cpu.copy(&dst, 4, &src, 8, 8).is_err());
    cpu.copy(&dst, 4, &src, 8, 4).unwrap();
    assert_eq!(dst.to_cpu(), vec![0, 3]);
}

#[test]
fn memory_limit_is_enforced_and_released() {
    let cpu = create_device(
        DeviceType::Cpu,
        &DeviceOptions {
            memory_limit_bytes: Some(64),
        },
    );
    let a = cpu.allocate::<f32>(12).unwrap();
    assert!(cpu.allocate::<f32>(8).is_err());
    drop(a);
    assert_eq!(cpu.memory().used(), 0);
    cpu.allocate::<f32>(16).unwrap();
}

fn mask_case() -> impl Strategy<Value = (usize, usize, Vec<f32>, Vec<bool>)> {
    (1usize..4, 1usize..100).prop_flat_map(|(rows, vocab)| {
        (
            Just(rows),
            Just(vocab),
            prop::collection::vec(-50.0f32..50.0, rows * vocab),
            prop::collection::vec(any::<bool>(), rows * vocab),
        )
    })
}

proptest! {
    #[test]
    fn device_mask_merge_matches_host_reference((rows, vocab, logits, allowed) in mask_case()) {
        let words: Vec<u32> = allowed
            .chunks(vocab)
            .flat_map(|row| {
                let mask = TokenMask::from_allowed(
                    vocab,
                    row.iter().enumerate().filter(|&(_, &a)| a).map(|(t, _)| t as u32),
                );
                mask.words().to_vec()
            })
            .collect();

        let mut expected = logits.clone();
        apply_token_mask(&mut expected, &words, vocab);
        for (i, (&a, &v)) in allowed.iter().zip(&expected).enumerate() {
            if a {
                prop_assert_eq!(v, logits[i]);
            } else {
                prop_assert_eq!(v, f32::NEG_INFINITY);
            }
        }

        for device_type in [DeviceType::Cpu, DeviceType::Cuda, DeviceType::WebGpu] {
            let device = create_device(device_type, &DeviceOptions::default());
            let span = device.upload(&logits).unwrap();
            let mask = device.upload(&words).unwrap();
            device.apply_mask(&span, &mask, vocab).unwrap();
            prop_assert_eq!(span.to_cpu(), expected.clone());
            prop_assert_eq!(rows * vocab, span.len());
        }
    }
}
