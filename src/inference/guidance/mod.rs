//! Constrained decoding.
//!
//! [`GuidanceLogitsProcessor`] keeps one constraint engine per row. Right after each
//! commit it dispatches the next step's mask computation onto the rayon pool and hands
//! the result back through a oneshot channel, so the masks are computed while the
//! engine runs the model. `process_logits` is the only place that waits for them; it
//! uploads the bitsets and merges them into the logits on the compute device.

pub mod constraint;
pub mod regex;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rayon::prelude::*;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::{GenError, Result};
use crate::inference::logit_processors::{LogitsContext, LogitsProcessor};
use crate::inference::params::GuidanceSpec;
use crate::kernels::{words_per_row, TokenMask};
use crate::tokenizer::Tokenizer;

pub use constraint::{
    CompilerRegistry, ConstraintCompiler, ConstraintEngine, TokenTrie, TokenizerEnv,
};
pub use regex::{ChoiceCompiler, Nfa, RegexCompiler, RegexConstraint};

/// Marker prepended before tokenizing a byte fragment.
pub const TOKENIZE_PREFIX: &[u8] = b"\x02";

/// Tokenize `bytes` as a continuation rather than as the start of a text.
///
/// Tokenizers treat the start of input specially (leading-space markers, merges across
/// the boundary). Encoding `TOKENIZE_PREFIX + bytes` and dropping the `prefix_len` ids
/// the prefix alone produces gives ids that are stable for fragments.
pub fn tokenize_partial(
    tokenizer: &dyn Tokenizer,
    prefix_len: usize,
    bytes: &[u8],
) -> Result<Vec<i32>> {
    let mut input = Vec::with_capacity(TOKENIZE_PREFIX.len() + bytes.len());
    input.extend_from_slice(TOKENIZE_PREFIX);
    input.extend_from_slice(bytes);
    let ids = tokenizer.encode(&input)?;
    if ids.len() < prefix_len {
        return Err(GenError::Tokenizer(format!(
            "prefix produced {} ids, expected at least {}",
            ids.len(),
            prefix_len
        )));
    }
    Ok(ids[prefix_len..].to_vec())
}

/// Compiler for `guidance_type`: a registered custom compiler, or a built-in one.
pub fn compiler_for(
    guidance_type: &str,
    registry: &CompilerRegistry,
) -> Result<Arc<dyn ConstraintCompiler>> {
    if let Some(compiler) = registry.get(guidance_type) {
        return Ok(Arc::clone(compiler));
    }
    match guidance_type {
        "regex" => Ok(Arc::new(RegexCompiler)),
        "choice" => Ok(Arc::new(ChoiceCompiler)),
        other => Err(GenError::InvalidArgument(format!(
            "no constraint compiler for guidance type '{}'",
            other
        ))),
    }
}

enum RowStep {
    Skip,
    Finish,
    Advance(u32),
}

struct RowConstraint {
    engine: Box<dyn ConstraintEngine>,
    finished: bool,
}

type SharedRows = Arc<Mutex<Vec<RowConstraint>>>;

struct MaskTask {
    rx: oneshot::Receiver<Result<Vec<TokenMask>>>,
    dispatched: Instant,
}

fn compute_masks(rows: &Mutex<Vec<RowConstraint>>, vocab_size: usize) -> Result<Vec<TokenMask>> {
    let mut rows = rows
        .lock()
        .map_err(|_| GenError::MaskComputation("constraint state poisoned".into()))?;
    rows.par_iter_mut()
        .map(|row| {
            if row.finished {
                Ok(TokenMask::allow_all(vocab_size))
            } else {
                row.engine.compute_mask().map(|m| m.resized(vocab_size))
            }
        })
        .collect()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "mask task panicked".to_string())
}

/// Per-row constraint masking of device logits.
///
/// Waiting on a mask blocks the calling thread; inside an async runtime drive the
/// generator from a blocking task (see [`crate::inference::StreamGenerator`]).
pub struct GuidanceLogitsProcessor {
    rows: SharedRows,
    eos_token_ids: Vec<i32>,
    vocab_size: usize,
    device: Arc<dyn DeviceInterface>,
    mask_buffer: DeviceSpan<u32>,
    pending: Option<MaskTask>,
    current: Option<Vec<TokenMask>>,
}

impl GuidanceLogitsProcessor {
    /// Compile `spec` once per row and dispatch the first mask computation.
    /// `vocab_size` is the width of a logits row.
    pub fn new(
        spec: &GuidanceSpec,
        compiler: &dyn ConstraintCompiler,
        env: &Arc<TokenizerEnv>,
        rows: usize,
        vocab_size: usize,
        eos_token_ids: &[i32],
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Self> {
        let engines = (0..rows)
            .map(|_| {
                compiler.compile(&spec.data, env).map(|engine| RowConstraint {
                    engine,
                    finished: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mask_buffer = device.allocate::<u32>(rows * words_per_row(vocab_size))?;
        debug!(
            guidance_type = %spec.guidance_type,
            rows,
            vocab_size,
            "guidance processor ready"
        );
        let mut processor = Self {
            rows: Arc::new(Mutex::new(engines)),
            eos_token_ids: eos_token_ids.to_vec(),
            vocab_size,
            device,
            mask_buffer,
            pending: None,
            current: None,
        };
        processor.dispatch();
        Ok(processor)
    }

    fn dispatch(&mut self) {
        let rows = Arc::clone(&self.rows);
        let vocab_size = self.vocab_size;
        let (tx, rx) = oneshot::channel();
        rayon::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| compute_masks(&rows, vocab_size)))
                .unwrap_or_else(|payload| Err(GenError::MaskComputation(panic_message(payload))));
            // The receiver is gone when the step was committed or the generator dropped.
            let _ = tx.send(result);
        });
        trace!("mask task dispatched");
        self.pending = Some(MaskTask {
            rx,
            dispatched: Instant::now(),
        });
    }

    fn await_masks(&mut self) -> Result<Vec<TokenMask>> {
        if self.pending.is_none() {
            self.dispatch();
        }
        let task = self
            .pending
            .take()
            .ok_or_else(|| GenError::MaskComputation("no mask task in flight".into()))?;
        let masks = task
            .rx
            .blocking_recv()
            .map_err(|_| GenError::MaskComputation("mask task dropped its result".into()))??;
        trace!(
            waited_us = task.dispatched.elapsed().as_micros() as u64,
            "mask task awaited"
        );
        Ok(masks)
    }

    /// Masks for the current step, waiting for the in-flight computation if needed.
    /// Stable until the next commit or reset.
    pub fn masks(&mut self) -> Result<&[TokenMask]> {
        if self.current.is_none() {
            self.current = Some(self.await_masks()?);
        }
        self.current
            .as_deref()
            .ok_or_else(|| GenError::MaskComputation("masks unavailable".into()))
    }

    /// Compute the current masks on the calling thread, bypassing the async task.
    pub fn compute_masks_now(&self) -> Result<Vec<TokenMask>> {
        compute_masks(&self.rows, self.vocab_size)
    }
}

impl LogitsProcessor for GuidanceLogitsProcessor {
    fn process_logits(&mut self, logits: &DeviceSpan<f32>, ctx: &LogitsContext<'_>) -> Result<()> {
        if ctx.vocab_size != self.vocab_size {
            return Err(GenError::InvalidArgument(format!(
                "logits rows have {} entries, processor expects {}",
                ctx.vocab_size, self.vocab_size
            )));
        }
        let words: Vec<u32> = self
            .masks()?
            .iter()
            .flat_map(|m| m.words().iter().copied())
            .collect();
        self.mask_buffer.copy_from_cpu(&words)?;
        self.device
            .apply_mask(logits, &self.mask_buffer, self.vocab_size)
    }

    /// Every row is checked against its current mask before any engine advances, so a
    /// rejected step leaves the constraint state untouched.
    fn commit_tokens(&mut self, tokens: &[i32]) -> Result<()> {
        let masks = self.masks()?.to_vec();
        if tokens.len() != masks.len() {
            return Err(GenError::InvalidArgument(format!(
                "{} tokens committed for {} rows",
                tokens.len(),
                masks.len()
            )));
        }
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| GenError::MaskComputation("constraint state poisoned".into()))?;

        let mut steps = Vec::with_capacity(tokens.len());
        for (index, ((row, &token), mask)) in rows.iter().zip(tokens).zip(&masks).enumerate() {
            let step = if row.finished {
                RowStep::Skip
            } else if self.eos_token_ids.contains(&token) {
                RowStep::Finish
            } else {
                let id = u32::try_from(token).map_err(|_| {
                    GenError::InvalidArgument(format!("negative token id {}", token))
                })?;
                if !mask.is_allowed(id) {
                    return Err(GenError::InvalidArgument(format!(
                        "token {} is not allowed by the constraint on row {}",
                        id, index
                    )));
                }
                RowStep::Advance(id)
            };
            steps.push(step);
        }

        for (row, step) in rows.iter_mut().zip(steps) {
            match step {
                RowStep::Skip => {}
                RowStep::Finish => row.finished = true,
                RowStep::Advance(id) => row.engine.commit_token(id).map_err(|e| {
                    GenError::MaskComputation(format!("engine rejected a masked-in token: {}", e))
                })?,
            }
        }
        drop(rows);

        self.current = None;
        self.dispatch();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.current = None;
        self.pending = None;
        {
            let mut rows = self
                .rows
                .lock()
                .map_err(|_| GenError::MaskComputation("constraint state poisoned".into()))?;
            for row in rows.iter_mut() {
                row.engine.reset();
                row.finished = false;
            }
        }
        self.dispatch();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "guidance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{create_device, DeviceOptions, DeviceType};
    use crate::inference::sequences::Sequences;
    use crate::tokenizer::ByteTokenizer;

    fn setup(
        device_type: DeviceType,
        pattern: &str,
        rows: usize,
    ) -> (GuidanceLogitsProcessor, Arc<dyn DeviceInterface>, ByteTokenizer) {
        let tok = ByteTokenizer::new(3, &["ab", "abc"]);
        let env = Arc::new(TokenizerEnv::new(Arc::new(tok.clone()), 2).unwrap());
        let device = create_device(device_type, &DeviceOptions::default());
        let spec = GuidanceSpec {
            guidance_type: "regex".into(),
            data: pattern.into(),
        };
        let p = GuidanceLogitsProcessor::new(
            &spec,
            &RegexCompiler,
            &env,
            rows,
            tok.vocab_size(),
            &[2],
            Arc::clone(&device),
        )
        .unwrap();
        (p, device, tok)
    }

    #[test]
    fn tokenize_partial_drops_prefix_ids() {
        let tok = ByteTokenizer::new(3, &["ab"]);
        let ids = tokenize_partial(&tok, 1, b"abb").unwrap();
        assert_eq!(ids, vec![3 + 256, tok.byte_token(b'b')]);
        assert!(tokenize_partial(&tok, 5, b"").is_err());
    }

    #[test]
    fn async_and_sync_masks_agree() {
        let (mut p, _, tok) = setup(DeviceType::Cpu, "ab(c|d)+", 2);
        let a = tok.byte_token(b'a');
        let b = tok.byte_token(b'b');
        p.commit_tokens(&[a, a]).unwrap();
        p.commit_tokens(&[b, b]).unwrap();
        let sync = p.compute_masks_now().unwrap();
        let awaited = p.masks().unwrap().to_vec();
        assert_eq!(sync, awaited);
        let allowed: Vec<u32> = awaited[0].allowed_tokens().collect();
        assert_eq!(
            allowed,
            vec![tok.byte_token(b'c') as u32, tok.byte_token(b'd') as u32]
        );
    }

    #[test]
    fn masked_tokens_never_win_on_accelerator() {
        let (mut p, device, tok) = setup(DeviceType::Cuda, "abc", 1);
        let vocab = tok.vocab_size();
        let mut host = vec![0.0f32; vocab];
        host[tok.byte_token(b'z') as usize] = 100.0;
        let logits = device.upload(&host).unwrap();
        let seq = Sequences::new(&device, 1, 4).unwrap();
        let ctx = LogitsContext {
            vocab_size: vocab,
            rows: 1,
            sequences: &seq,
            device: &device,
        };
        p.process_logits(&logits, &ctx).unwrap();
        let out = logits.to_cpu();
        let best = crate::kernels::argmax(&out).unwrap();
        assert!(p.masks().unwrap()[0].is_allowed(best as u32));
        assert_eq!(out[tok.byte_token(b'z') as usize], f32::NEG_INFINITY);
    }

    #[test]
    fn masks_stay_fixed_until_commit() {
        let (mut p, _, tok) = setup(DeviceType::Cpu, "ab", 1);
        let first = p.masks().unwrap().to_vec();
        assert_eq!(p.masks().unwrap(), first.as_slice());
        p.commit_tokens(&[tok.byte_token(b'a')]).unwrap();
        assert_ne!(p.masks().unwrap(), first.as_slice());
    }

    #[test]
    fn finished_rows_stop_advancing_and_reset_restores() {
        let (mut p, _, tok) = setup(DeviceType::Cpu, "a", 2);
        let a = tok.byte_token(b'a');
        p.commit_tokens(&[a, a]).unwrap();
        p.commit_tokens(&[2, 2]).unwrap();
        // Finished rows accept padding without consulting their engine.
        p.commit_tokens(&[0, 0]).unwrap();
        assert_eq!(p.masks().unwrap()[0].num_allowed(), tok.vocab_size());

        p.reset().unwrap();
        let masks = p.masks().unwrap();
        assert_eq!(masks[1].allowed_tokens().collect::<Vec<_>>(), vec![a as u32]);
    }

    #[test]
    fn rejected_tokens_surface_errors() {
        let (mut p, _, tok) = setup(DeviceType::Cpu, "a", 1);
        let err = p.commit_tokens(&[tok.byte_token(b'q')]).unwrap_err();
        assert!(matches!(err, GenError::InvalidArgument(_)));
        assert!(p.commit_tokens(&[1, 2]).is_err());
    }

    #[test]
    fn one_bad_row_rejects_the_whole_step() {
        let (mut p, _, tok) = setup(DeviceType::Cpu, "ab", 2);
        let a = tok.byte_token(b'a');
        let err = p.commit_tokens(&[a, tok.byte_token(b'q')]).unwrap_err();
        assert!(matches!(err, GenError::InvalidArgument(_)));

        // Row 0 is still at the start of the pattern.
        let b = tok.byte_token(b'b') as u32;
        let masks = p.masks().unwrap();
        assert!(masks[0].is_allowed(a as u32) && !masks[0].is_allowed(b));
        p.commit_tokens(&[a, a]).unwrap();
        assert!(p.masks().unwrap().iter().all(|m| m.is_allowed(b)));
    }
}
