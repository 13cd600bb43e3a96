//! Logits processors: in-place transformations of one step's device logits before
//! token selection.
//!
//! Processors are chained: raw logits → proc1 → proc2 → … → search policy.

use std::sync::Arc;

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::Result;
use crate::inference::sequences::Sequences;
use crate::model::EosTokens;

/// What a processor may read besides the logits themselves.
pub struct LogitsContext<'a> {
    pub vocab_size: usize,
    pub rows: usize,
    pub sequences: &'a Sequences,
    pub device: &'a Arc<dyn DeviceInterface>,
}

pub trait LogitsProcessor: Send {
    /// Rewrite `[rows, vocab_size]` logits in place.
    fn process_logits(&mut self, logits: &DeviceSpan<f32>, ctx: &LogitsContext<'_>) -> Result<()>;

    /// Advance internal state with the tokens selected this step, one per row.
    fn commit_tokens(&mut self, tokens: &[i32]) -> Result<()> {
        let _ = tokens;
        Ok(())
    }

    /// Return to the initial state.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Repetition penalty (transformers-style): scale down logits of tokens already in the row.
#[derive(Clone, Debug)]
pub struct RepetitionPenaltyProcessor {
    pub penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process_logits(&mut self, logits: &DeviceSpan<f32>, ctx: &LogitsContext<'_>) -> Result<()> {
        if self.penalty <= 0.0 || (self.penalty - 1.0).abs() < 1e-6 {
            return Ok(());
        }
        let history: Vec<Vec<i32>> = (0..ctx.rows)
            .map(|row| ctx.sequences.row_tokens(row))
            .collect::<Result<_>>()?;
        logits.with_cpu_mut(|scores| {
            for (row, tokens) in scores.chunks_mut(ctx.vocab_size).zip(&history) {
                let mut seen = vec![false; ctx.vocab_size];
                for &tid in tokens {
                    let Ok(t) = usize::try_from(tid) else { continue };
                    if t >= ctx.vocab_size || std::mem::replace(&mut seen[t], true) {
                        continue;
                    }
                    let v = row[t];
                    row[t] = if v > 0.0 {
                        v / self.penalty
                    } else {
                        v * self.penalty
                    };
                }
            }
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Block every end-of-sequence token until rows reach `min_length` tokens.
#[derive(Clone, Debug)]
pub struct MinLengthProcessor {
    pub min_length: usize,
    pub eos_token_ids: Vec<i32>,
}

impl MinLengthProcessor {
    pub fn new(min_length: usize, eos: &EosTokens) -> Self {
        Self {
            min_length,
            eos_token_ids: eos.as_slice().to_vec(),
        }
    }
}

impl LogitsProcessor for MinLengthProcessor {
    fn process_logits(&mut self, logits: &DeviceSpan<f32>, ctx: &LogitsContext<'_>) -> Result<()> {
        if ctx.sequences.current_length() >= self.min_length {
            return Ok(());
        }
        logits.with_cpu_mut(|scores| {
            for row in scores.chunks_mut(ctx.vocab_size) {
                for &eos in &self.eos_token_ids {
                    if let Some(v) = usize::try_from(eos).ok().and_then(|t| row.get_mut(t)) {
                        *v = f32::NEG_INFINITY;
                    }
                }
            }
        });
        Ok(())
    }

    fn name(&self) -> &'static str {
        "min_length"
    }
}

/// Chain of processors: applied in order.
#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_processor<P: LogitsProcessor + 'static>(mut self, p: P) -> Self {
        self.processors.push(Box::new(p));
        self
    }

    pub fn add_boxed(&mut self, p: Box<dyn LogitsProcessor>) {
        self.processors.push(p);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    pub fn process_logits(&mut self, logits: &DeviceSpan<f32>, ctx: &LogitsContext<'_>) -> Result<()> {
        for p in &mut self.processors {
            p.process_logits(logits, ctx)?;
        }
        Ok(())
    }

    pub fn commit_tokens(&mut self, tokens: &[i32]) -> Result<()> {
        for p in &mut self.processors {
            p.commit_tokens(tokens)?;
        }
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        for p in &mut self.processors {
            p.reset()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{create_device, DeviceOptions, DeviceType};

    #[test]
    fn penalty_and_min_length_chain() {
        let device = create_device(DeviceType::Cpu, &DeviceOptions::default());
        let mut seq = Sequences::new(&device, 1, 8).unwrap();
        seq.append(&[1, 1], 2).unwrap();
        let logits = device.upload(&[1.0f32, 2.0, -1.0, 4.0]).unwrap();
        let ctx = LogitsContext {
            vocab_size: 4,
            rows: 1,
            sequences: &seq,
            device: &device,
        };
        let mut chain = ProcessorChain::new()
            .add_processor(RepetitionPenaltyProcessor::new(2.0))
            .add_processor(MinLengthProcessor::new(3, &EosTokens::One(3)));
        chain.process_logits(&logits, &ctx).unwrap();
        assert_eq!(logits.to_cpu(), vec![1.0, 1.0, -1.0, f32::NEG_INFINITY]);
        assert_eq!(chain.names(), vec!["repetition_penalty", "min_length"]);
    }

    #[test]
    fn min_length_lifts_once_reached() {
        let device = create_device(DeviceType::WebGpu, &DeviceOptions::default());
        let mut seq = Sequences::new(&device, 2, 4).unwrap();
        seq.append(&[0, 0], 1).unwrap();
        let logits = device.upload(&[0.5f32; 4]).unwrap();
        let ctx = LogitsContext {
            vocab_size: 2,
            rows: 2,
            sequences: &seq,
            device: &device,
        };
        let mut p = MinLengthProcessor::new(1, &EosTokens::One(1));
        p.process_logits(&logits, &ctx).unwrap();
        assert_eq!(logits.to_cpu(), vec![0.5; 4]);
    }
}
