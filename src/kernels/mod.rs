//! Host kernels over logits rows.

pub mod mask;

pub use mask::{apply_token_mask, words_per_row, TokenMask};

/// Argmax over a slice of f32. Ties resolve to the lowest index.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in scores.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Numerically stable softmax of `logits / temperature`.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = temperature.max(1e-6);
    let max_ln = logits
        .iter()
        .map(|&v| v / t)
        .fold(f32::NEG_INFINITY, f32::max);
    if !max_ln.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exp: Vec<f32> = logits.iter().map(|&v| (v / t - max_ln).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_prefers_first_max_and_skips_nan() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 0.5]), Some(1));
        assert_eq!(argmax(&[f32::NEG_INFINITY, -1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn softmax_sums_to_one_and_ignores_masked() {
        let probs = softmax(&[0.0, 1.0, f32::NEG_INFINITY], 1.0);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(probs[2], 0.0);
    }
}
