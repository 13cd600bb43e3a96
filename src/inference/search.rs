//! Token-selection policies.
//!
//! A policy sees the processed logits of one step on the host and returns one token
//! per row. Rows already finished are skipped; the generator pads them itself.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::{GenError, Result};
use crate::kernels::{argmax, softmax};
use crate::model::SearchConfig;

pub trait SearchPolicy: Send {
    /// Select the next token of every row from `[rows, vocab_size]` logits.
    /// Entries for rows with `done[row]` are ignored by the caller.
    fn select_next_tokens(
        &mut self,
        logits: &[f32],
        vocab_size: usize,
        done: &[bool],
    ) -> Result<Vec<i32>>;

    fn name(&self) -> &'static str;
}

/// Build the policy described by `search`. Beam search is not built in.
pub fn create_search(search: &SearchConfig) -> Result<Box<dyn SearchPolicy>> {
    if search.num_beams > 1 {
        return Err(GenError::InvalidArgument(format!(
            "num_beams = {} needs a beam search policy; inject one with Generator::with_search",
            search.num_beams
        )));
    }
    if search.do_sample {
        Ok(Box::new(SamplingSearch::new(search)))
    } else {
        Ok(Box::new(GreedySearch))
    }
}

fn all_masked(row: usize) -> GenError {
    GenError::InvalidState(format!("every token of row {} is masked", row))
}

/// Argmax per row; ties go to the lowest token id.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedySearch;

impl SearchPolicy for GreedySearch {
    fn select_next_tokens(
        &mut self,
        logits: &[f32],
        vocab_size: usize,
        done: &[bool],
    ) -> Result<Vec<i32>> {
        logits
            .chunks(vocab_size)
            .zip(done)
            .enumerate()
            .map(|(row, (scores, &finished))| {
                if finished {
                    return Ok(0);
                }
                match argmax(scores) {
                    Some(i) if scores[i] > f32::NEG_INFINITY => Ok(i as i32),
                    _ => Err(all_masked(row)),
                }
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "greedy"
    }
}

/// Temperature, top-k and top-p sampling with a seedable RNG.
#[derive(Debug, Clone)]
pub struct SamplingSearch {
    rng: StdRng,
    top_k: usize,
    top_p: f32,
    temperature: f32,
}

impl SamplingSearch {
    pub fn new(search: &SearchConfig) -> Self {
        let rng = match search.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            top_k: search.top_k,
            top_p: search.top_p,
            temperature: search.temperature,
        }
    }

    /// Candidates sorted by score: masked entries dropped, then top-k, then top-p.
    fn candidates(&self, scores: &[f32]) -> Vec<(usize, f32)> {
        let mut indexed: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > f32::NEG_INFINITY && !v.is_nan())
            .map(|(i, &v)| (i, v))
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        if self.top_k > 0 {
            indexed.truncate(self.top_k);
        }
        if self.top_p < 1.0 && !indexed.is_empty() {
            let values: Vec<f32> = indexed.iter().map(|(_, v)| *v).collect();
            let probs = softmax(&values, self.temperature);
            let mut cum = 0.0f32;
            let mut keep = indexed.len();
            for (i, pr) in probs.iter().enumerate() {
                cum += pr;
                if cum >= self.top_p {
                    keep = i + 1;
                    break;
                }
            }
            indexed.truncate(keep.max(1));
        }
        indexed
    }

    fn sample_row(&mut self, scores: &[f32]) -> Option<usize> {
        let candidates = self.candidates(scores);
        let values: Vec<f32> = candidates.iter().map(|(_, v)| *v).collect();
        let probs = softmax(&values, self.temperature);
        let r: f32 = self.rng.gen();
        let mut cum = 0.0f32;
        for (&(idx, _), pr) in candidates.iter().zip(&probs) {
            cum += pr;
            if r <= cum {
                return Some(idx);
            }
        }
        candidates.last().map(|(i, _)| *i)
    }
}

impl SearchPolicy for SamplingSearch {
    fn select_next_tokens(
        &mut self,
        logits: &[f32],
        vocab_size: usize,
        done: &[bool],
    ) -> Result<Vec<i32>> {
        let mut out = Vec::with_capacity(done.len());
        for (row, (scores, &finished)) in logits.chunks(vocab_size).zip(done).enumerate() {
            if finished {
                out.push(0);
                continue;
            }
            let token = self.sample_row(scores).ok_or_else(|| all_masked(row))?;
            out.push(token as i32);
        }
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "sampling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax_per_row() {
        let logits = [0.0, 3.0, 1.0, 5.0, 0.0, 1.0];
        let out = GreedySearch
            .select_next_tokens(&logits, 3, &[false, false])
            .unwrap();
        assert_eq!(out, vec![1, 0]);
    }

    #[test]
    fn fully_masked_row_is_an_error() {
        let ninf = f32::NEG_INFINITY;
        assert!(GreedySearch
            .select_next_tokens(&[ninf, ninf], 2, &[false])
            .is_err());
        assert!(GreedySearch.select_next_tokens(&[ninf, ninf], 2, &[true]).is_ok());
    }

    #[test]
    fn sampling_never_picks_masked_tokens() {
        let config = SearchConfig {
            do_sample: true,
            top_k: 0,
            random_seed: Some(7),
            ..SearchConfig::default()
        };
        let mut search = SamplingSearch::new(&config);
        let ninf = f32::NEG_INFINITY;
        for _ in 0..50 {
            let out = search
                .select_next_tokens(&[ninf, 0.0, ninf, 0.0], 4, &[false])
                .unwrap();
            assert!(out[0] == 1 || out[0] == 3);
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let config = SearchConfig {
            do_sample: true,
            top_p: 0.9,
            temperature: 0.7,
            random_seed: Some(42),
            ..SearchConfig::default()
        };
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32).collect();
        let a = SamplingSearch::new(&config)
            .select_next_tokens(&logits, 32, &[false])
            .unwrap();
        let b = SamplingSearch::new(&config)
            .select_next_tokens(&logits, 32, &[false])
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn beams_need_an_injected_policy() {
        let config = SearchConfig {
            num_beams: 4,
            ..SearchConfig::default()
        };
        assert!(create_search(&config).is_err());
    }
}
