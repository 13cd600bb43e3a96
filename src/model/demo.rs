//! Engines that need no weights: a seeded pseudo-random demo engine and a scripted
//! engine for tests and golden outputs.

use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::engine::{EngineFactory, ExecutionEngine, StepInputs};
use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::{GenError, Result};
use crate::inference::params::GeneratorParams;

/// Write host logits to the step's output buffer: the captured graph's static logits
/// when replaying, otherwise a fresh device allocation.
fn emit_logits(
    device: &Arc<dyn DeviceInterface>,
    inputs: &StepInputs<'_>,
    host: &[f32],
) -> Result<DeviceSpan<f32>> {
    let span = match inputs.graph {
        Some(graph) => graph.logits(host.len())?,
        None => device.allocate::<f32>(host.len())?,
    };
    span.copy_from_cpu(host)?;
    Ok(span)
}

/// Last token of every row of `[rows, new_tokens]` ids.
fn last_tokens(inputs: &StepInputs<'_>) -> Vec<i32> {
    let ids = inputs.input_ids.to_cpu();
    ids.chunks(inputs.new_tokens.max(1))
        .map(|row| row.last().copied().unwrap_or(0))
        .collect()
}

/// Pseudo-random logits keyed on (seed, last token, position): the same prefix
/// always yields the same scores.
pub struct DemoEngine {
    device: Arc<dyn DeviceInterface>,
    vocab_size: usize,
    seed: u64,
}

impl ExecutionEngine for DemoEngine {
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<DeviceSpan<f32>> {
        let mut host = Vec::with_capacity(inputs.rows * self.vocab_size);
        for last in last_tokens(inputs) {
            let key = self.seed
                ^ ((last as u32 as u64) << 32)
                ^ (inputs.total_length as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let mut rng = StdRng::seed_from_u64(key);
            host.extend((0..self.vocab_size).map(|_| rng.gen_range(-4.0f32..4.0f32)));
        }
        emit_logits(&self.device, inputs, &host)
    }
}

#[derive(Debug, Clone)]
pub struct DemoEngineFactory {
    seed: u64,
}

impl DemoEngineFactory {
    pub fn new() -> Self {
        Self::seeded(rand::random::<u64>())
    }

    /// Deterministic engine (for tests and golden outputs).
    pub fn seeded(seed: u64) -> Self {
        Self { seed }
    }
}

impl Default for DemoEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for DemoEngineFactory {
    fn create_engine(
        &self,
        params: &GeneratorParams,
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Box<dyn ExecutionEngine>> {
        Ok(Box::new(DemoEngine {
            device,
            vocab_size: params.config().vocab_size,
            seed: self.seed,
        }))
    }
}

/// What a script sees when choosing the favored token of one row.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext {
    /// 1-based engine call number.
    pub call: usize,
    pub row: usize,
    pub last_token: i32,
    pub total_length: usize,
}

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCall {
    pub rows: usize,
    pub new_tokens: usize,
    pub total_length: usize,
    pub input_ids: Vec<i32>,
    pub captured: bool,
}

#[derive(Debug, Default)]
struct EngineLogInner {
    calls: Vec<EngineCall>,
    rewinds: Vec<usize>,
    options: Vec<(String, String)>,
    finalized: usize,
}

/// Shared record of everything scripted engines were asked to do.
#[derive(Debug, Clone, Default)]
pub struct EngineLog(Arc<Mutex<EngineLogInner>>);

impl EngineLog {
    fn with<R>(&self, f: impl FnOnce(&mut EngineLogInner) -> R) -> R {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.with(|log| log.calls.clone())
    }

    pub fn rewinds(&self) -> Vec<usize> {
        self.with(|log| log.rewinds.clone())
    }

    pub fn options(&self) -> Vec<(String, String)> {
        self.with(|log| log.options.clone())
    }

    pub fn finalized(&self) -> usize {
        self.with(|log| log.finalized)
    }
}

type Script = dyn Fn(&ScriptContext) -> i32 + Send + Sync;

/// Engine whose logits put a score of 10 on one scripted token per row and 0 elsewhere.
pub struct ScriptedEngine {
    device: Arc<dyn DeviceInterface>,
    vocab_size: usize,
    script: Arc<Script>,
    log: EngineLog,
    fail_on_call: Option<usize>,
    calls: usize,
}

impl ExecutionEngine for ScriptedEngine {
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<DeviceSpan<f32>> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(GenError::Engine(format!("scripted failure on call {}", self.calls)));
        }
        self.log.with(|log| {
            log.calls.push(EngineCall {
                rows: inputs.rows,
                new_tokens: inputs.new_tokens,
                total_length: inputs.total_length,
                input_ids: inputs.input_ids.to_cpu(),
                captured: inputs.graph.is_some(),
            })
        });

        let mut host = vec![0.0f32; inputs.rows * self.vocab_size];
        for (row, last_token) in last_tokens(inputs).into_iter().enumerate() {
            let favored = (self.script)(&ScriptContext {
                call: self.calls,
                row,
                last_token,
                total_length: inputs.total_length,
            });
            if favored >= 0 && (favored as usize) < self.vocab_size {
                host[row * self.vocab_size + favored as usize] = 10.0;
            }
        }
        emit_logits(&self.device, inputs, &host)
    }

    fn rewind_to(&mut self, length: usize) -> Result<()> {
        self.log.with(|log| log.rewinds.push(length));
        Ok(())
    }

    fn finalize(&mut self) {
        self.log.with(|log| log.finalized += 1);
    }

    fn set_runtime_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.log
            .with(|log| log.options.push((key.to_string(), value.to_string())));
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScriptedEngineFactory {
    script: Arc<Script>,
    log: EngineLog,
    fail_on_call: Option<usize>,
}

impl ScriptedEngineFactory {
    pub fn new(script: impl Fn(&ScriptContext) -> i32 + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            log: EngineLog::default(),
            fail_on_call: None,
        }
    }

    /// Every engine built by this factory fails its `call`-th run.
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn log(&self) -> EngineLog {
        self.log.clone()
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn create_engine(
        &self,
        params: &GeneratorParams,
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Box<dyn ExecutionEngine>> {
        Ok(Box::new(ScriptedEngine {
            device,
            vocab_size: params.config().vocab_size,
            script: Arc::clone(&self.script),
            log: self.log.clone(),
            fail_on_call: self.fail_on_call,
            calls: 0,
        }))
    }
}
