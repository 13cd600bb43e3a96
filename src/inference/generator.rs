//! The per-request generation state machine.
//!
//! ```text
//! Created ──append_tokens──▶ Ready ──compute_logits──▶ LogitsComputed
//!    ▲                        ▲  │                          │
//!    │                        │  └──generate_next_token─────┤ (computes if needed)
//!    └──rewind_to_length──────┴──────select/append/commit◀──┘
//! ```
//!
//! `computed_logits` is true exactly between a logits computation and the token
//! selection that consumes it. Appending while it is set, or computing twice, is an
//! InvalidState error.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::{GenError, Result};
use crate::inference::graph::CapturedGraph;
use crate::inference::logit_processors::{
    LogitsContext, MinLengthProcessor, ProcessorChain, RepetitionPenaltyProcessor,
};
use crate::inference::params::GeneratorParams;
use crate::inference::search::{create_search, SearchPolicy};
use crate::inference::sequences::Sequences;
use crate::model::{ExecutionEngine, Model, StepInputs};
use crate::runtime;

pub struct Generator {
    model: Arc<Model>,
    params: Arc<GeneratorParams>,
    device: Arc<dyn DeviceInterface>,
    engine: Box<dyn ExecutionEngine>,
    search: Box<dyn SearchPolicy>,
    processors: ProcessorChain,
    sequences: Sequences,
    graph: Option<CapturedGraph>,
    done: Vec<bool>,
    /// Positions holding generated (not appended) tokens, ascending.
    generated: Vec<usize>,
    /// Positions already fed to the engine.
    processed_length: usize,
    logits: Option<DeviceSpan<f32>>,
    computed_logits: bool,
    session_terminated: bool,
    unusable: Option<&'static str>,
    finalized: bool,
    steps: usize,
}

impl Generator {
    /// Build a generator with the search policy described by `params.search()`.
    pub fn new(model: Arc<Model>, params: Arc<GeneratorParams>) -> Result<Self> {
        let search = create_search(params.search())?;
        Self::with_search(model, params, search)
    }

    /// Build a generator around a caller-provided search policy (e.g. beam search).
    pub fn with_search(
        model: Arc<Model>,
        params: Arc<GeneratorParams>,
        search: Box<dyn SearchPolicy>,
    ) -> Result<Self> {
        runtime::globals()?;
        if !Arc::ptr_eq(params.config(), model.config()) {
            return Err(GenError::invalid_argument(
                "generator params were built for a different model",
            ));
        }
        let config = model.config();
        let s = params.search();
        if s.batch_size == 0 || s.num_beams == 0 {
            return Err(GenError::invalid_argument("batch_size and num_beams must be positive"));
        }
        if s.max_length == 0 || s.max_length > config.context_length {
            return Err(GenError::InvalidArgument(format!(
                "max_length {} must be in 1..={}",
                s.max_length, config.context_length
            )));
        }
        if let crate::inference::params::ModalityInputs::Audio(audio) = params.inputs() {
            if audio.input_features.is_none() {
                return Err(GenError::invalid_argument(
                    "audio models require 'input_features' before generation",
                ));
            }
        }

        let device = Arc::clone(model.device());
        let rows = params.batch_beam_size();
        let sequences = Sequences::new(&device, rows, s.max_length)?;
        let engine = model.factory().create_engine(&params, Arc::clone(&device))?;
        let processors = build_processors(&model, &params, rows, &device)?;

        let graph = if !params.use_graph_capture() {
            None
        } else if rows > params.max_batch_size() {
            debug!(
                rows,
                max_batch_size = params.max_batch_size(),
                "graph capture declined for oversized batch"
            );
            None
        } else {
            Some(
                model
                    .graph_pool()
                    .acquire(&device, params.max_batch_size(), config.vocab_size)?,
            )
        };

        info!(
            rows,
            max_length = s.max_length,
            device = %device.device_type(),
            search = search.name(),
            processors = ?processors.names(),
            graph_capture = graph.is_some(),
            "generator created"
        );

        let prompt = params.inputs().prompt_ids().to_vec();
        let mut generator = Self {
            model,
            params,
            device,
            engine,
            search,
            processors,
            sequences,
            graph,
            done: vec![false; rows],
            generated: Vec::new(),
            processed_length: 0,
            logits: None,
            computed_logits: false,
            session_terminated: false,
            unusable: None,
            finalized: false,
            steps: 0,
        };
        if !prompt.is_empty() {
            generator.append_prompt(&prompt)?;
        }
        Ok(generator)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn params(&self) -> &Arc<GeneratorParams> {
        &self.params
    }

    pub fn rows(&self) -> usize {
        self.sequences.rows()
    }

    pub fn sequence_length(&self) -> usize {
        self.sequences.current_length()
    }

    pub fn computed_logits(&self) -> bool {
        self.computed_logits
    }

    /// Completed `generate_next_token` calls.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_row_done(&self, row: usize) -> bool {
        self.done.get(row).copied().unwrap_or(false)
    }

    /// Append prompt tokens. `ids` holds `batch_size` equal-length entries back to back;
    /// each entry is copied to all of its beams.
    pub fn append_tokens(&mut self, ids: &[i32]) -> Result<()> {
        self.check_usable()?;
        self.check_session()?;
        if self.computed_logits {
            return Err(GenError::invalid_state(
                "append_tokens called while logits are computed; generate a token or rewind first",
            ));
        }
        if self.params.inputs().is_audio() {
            return Err(GenError::invalid_argument(
                "append_tokens is not supported for audio models",
            ));
        }
        let result = self.append_prompt(ids);
        self.track(result)
    }

    fn append_prompt(&mut self, ids: &[i32]) -> Result<()> {
        let batch = self.params.search().batch_size;
        let beams = self.params.search().num_beams;
        if ids.is_empty() {
            return Err(GenError::invalid_argument("append_tokens needs at least one token"));
        }
        if ids.len() % batch != 0 {
            return Err(GenError::InvalidArgument(format!(
                "{} tokens cannot be split evenly over batch size {}",
                ids.len(),
                batch
            )));
        }
        let per_entry = ids.len() / batch;
        let current = self.sequences.current_length();
        if current + per_entry > self.sequences.max_length() {
            return Err(GenError::InvalidArgument(format!(
                "appending {} tokens to length {} exceeds max_length {}",
                per_entry,
                current,
                self.sequences.max_length()
            )));
        }
        if current > 0 && batch > 1 {
            return Err(GenError::invalid_state(
                "batched generators accept one append; rewind to 0 first",
            ));
        }
        if current > 0 && !self.device.supports_continuous_decoding() {
            return Err(GenError::InvalidState(format!(
                "{} does not support continuing an existing sequence",
                self.device.device_type()
            )));
        }

        let expanded: Vec<i32> = ids
            .chunks(per_entry)
            .flat_map(|entry| std::iter::repeat(entry).take(beams).flatten())
            .copied()
            .collect();
        self.sequences.append(&expanded, per_entry)?;
        self.done.iter_mut().for_each(|d| *d = false);
        self.finalized = false;
        debug!(
            appended = per_entry,
            length = self.sequences.current_length(),
            "tokens appended"
        );
        Ok(())
    }

    /// Run the engine on the pending positions and the processors on its logits.
    pub fn compute_logits(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.computed_logits {
            return Err(GenError::invalid_state(
                "logits already computed for this step; generate a token first",
            ));
        }
        self.check_session()?;
        let result = self.run_step();
        self.track(result)
    }

    fn run_step(&mut self) -> Result<()> {
        if self.is_done() {
            return Err(GenError::invalid_state("generation is done"));
        }
        let current = self.sequences.current_length();
        if self.processed_length >= current {
            return Err(GenError::invalid_state(
                "no pending input; call append_tokens first",
            ));
        }
        let rows = self.sequences.rows();
        let vocab_size = self.model.config().vocab_size;
        let new_tokens = current - self.processed_length;
        let host_ids = self.sequences.tail(self.processed_length);

        let graph = self.graph.as_ref().filter(|_| new_tokens == 1);
        let input_ids = match graph {
            Some(g) => g.input_ids(host_ids.len())?,
            None => self.device.allocate::<i32>(host_ids.len())?,
        };
        input_ids.copy_from_cpu(&host_ids)?;

        let step = StepInputs {
            input_ids: &input_ids,
            rows,
            new_tokens,
            total_length: current,
            modality: self.params.inputs(),
            extra_inputs: self.params.extra_inputs(),
            graph,
        };
        let logits = self.engine.run(&step)?;
        if logits.len() != rows * vocab_size {
            return Err(GenError::Engine(format!(
                "engine returned {} logits, expected {} rows x {} vocab",
                logits.len(),
                rows,
                vocab_size
            )));
        }
        self.device.ensure_owns(&logits)?;
        self.processed_length = current;

        let ctx = LogitsContext {
            vocab_size,
            rows,
            sequences: &self.sequences,
            device: &self.device,
        };
        self.processors.process_logits(&logits, &ctx)?;
        self.logits = Some(logits);
        self.computed_logits = true;
        trace!(new_tokens, length = current, captured = graph.is_some(), "logits computed");
        Ok(())
    }

    /// Compute logits if this step has none yet, select one token per row, append it
    /// and commit it to the processors.
    pub fn generate_next_token(&mut self) -> Result<()> {
        self.check_usable()?;
        self.check_session()?;
        if !self.computed_logits {
            self.compute_logits()?;
        }
        let result = self.select_and_commit();
        self.track(result)
    }

    fn select_and_commit(&mut self) -> Result<()> {
        let logits = self
            .logits
            .clone()
            .ok_or_else(|| GenError::invalid_state("no logits for this step"))?;
        let config = Arc::clone(self.model.config());
        let host = logits.to_cpu();
        let mut next = self
            .search
            .select_next_tokens(&host, config.vocab_size, &self.done)?;
        if next.len() != self.done.len() {
            return Err(GenError::InvalidState(format!(
                "search policy returned {} tokens for {} rows",
                next.len(),
                self.done.len()
            )));
        }
        for (token, &finished) in next.iter_mut().zip(&self.done) {
            if finished {
                *token = config.pad_token_id;
            }
        }

        let position = self.sequences.current_length();
        if position >= self.sequences.max_length() {
            self.logits = None;
            self.computed_logits = false;
            return Err(GenError::InvalidState(format!(
                "sequences are already at max_length {}",
                position
            )));
        }
        self.processors.commit_tokens(&next)?;
        self.sequences.append(&next, 1)?;
        self.generated.push(position);
        for (finished, &token) in self.done.iter_mut().zip(&next) {
            if config.eos_token_id.contains(token) {
                *finished = true;
            }
        }
        self.logits = None;
        self.computed_logits = false;
        self.steps += 1;
        debug!(step = self.steps, tokens = ?next, "token generated");

        if self.is_done() && !self.finalized {
            self.engine.finalize();
            self.finalized = true;
            info!(
                steps = self.steps,
                length = self.sequences.current_length(),
                "generation done"
            );
        }
        Ok(())
    }

    /// Truncate every row to `length` tokens and drop any computed logits.
    pub fn rewind_to_length(&mut self, length: usize) -> Result<()> {
        self.check_usable()?;
        if self.params.inputs().is_audio() {
            return Err(GenError::invalid_argument("audio models cannot rewind"));
        }
        let current = self.sequences.current_length();
        if length > current {
            return Err(GenError::InvalidArgument(format!(
                "cannot rewind to {} past current length {}",
                length, current
            )));
        }
        if self.params.search().batch_size > 1 && length != 0 {
            return Err(GenError::invalid_argument(
                "batched generators can only rewind to 0",
            ));
        }
        let keep = self.processed_length.min(length.saturating_sub(1));
        let result = self.rewind_inner(length, keep);
        self.track(result)
    }

    fn rewind_inner(&mut self, length: usize, keep: usize) -> Result<()> {
        self.engine.rewind_to(keep)?;
        self.sequences.rewind_to(length)?;
        self.processed_length = keep;
        self.logits = None;
        self.computed_logits = false;
        self.done.iter_mut().for_each(|d| *d = false);
        self.finalized = false;
        self.generated.retain(|&position| position < length);
        self.processors.reset()?;
        self.replay_generated()?;
        debug!(length, pending_from = keep, "rewound");
        Ok(())
    }

    /// Re-commit the kept generated tokens so stateful processors resume where the
    /// truncated sequence ends.
    fn replay_generated(&mut self) -> Result<()> {
        if self.generated.is_empty() {
            return Ok(());
        }
        let config = Arc::clone(self.model.config());
        let history = (0..self.sequences.rows())
            .map(|row| self.sequences.row_tokens(row))
            .collect::<Result<Vec<_>>>()?;
        for &position in &self.generated {
            let step = history
                .iter()
                .map(|row| row.get(position).copied())
                .collect::<Option<Vec<i32>>>()
                .ok_or_else(|| {
                    GenError::InvalidState(format!("no token at generated position {}", position))
                })?;
            self.processors.commit_tokens(&step)?;
            for (finished, &token) in self.done.iter_mut().zip(&step) {
                if config.eos_token_id.contains(token) {
                    *finished = true;
                }
            }
        }
        trace!(replayed = self.generated.len(), "processor state replayed");
        Ok(())
    }

    /// True when every row has emitted an end-of-sequence token or the sequences hit
    /// `max_length`. Never true while logits are computed.
    pub fn is_done(&self) -> bool {
        if self.computed_logits {
            return false;
        }
        self.sequences.current_length() >= self.sequences.max_length()
            || (!self.done.is_empty() && self.done.iter().all(|&d| d))
    }

    /// Device view of one row's committed tokens. Invalidated by the next append,
    /// step or rewind; copy it out to keep it.
    pub fn get_sequence(&self, row: usize) -> Result<DeviceSpan<i32>> {
        self.sequences.sequence(row)
    }

    /// Processed logits of the current step, computing them first if needed.
    pub fn get_logits(&mut self) -> Result<DeviceSpan<f32>> {
        if !self.computed_logits {
            self.compute_logits()?;
        }
        self.logits
            .clone()
            .ok_or_else(|| GenError::invalid_state("no logits for this step"))
    }

    /// Replace this step's logits. They count as computed, so the next
    /// `generate_next_token` selects from them without running the engine.
    pub fn set_logits(&mut self, logits: DeviceSpan<f32>) -> Result<()> {
        self.check_usable()?;
        self.check_session()?;
        if self.is_done() {
            return Err(GenError::invalid_state(
                "generation is done; rewind before setting logits",
            ));
        }
        let expected = self.sequences.rows() * self.model.config().vocab_size;
        if logits.len() != expected {
            return Err(GenError::InvalidArgument(format!(
                "logits have {} entries, expected {}",
                logits.len(),
                expected
            )));
        }
        self.device.ensure_owns(&logits)?;
        self.logits = Some(logits);
        self.computed_logits = true;
        Ok(())
    }

    /// `terminate_session` ("1"/"0") toggles this generator's termination flag; other
    /// keys go to the engine.
    pub fn set_runtime_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "terminate_session" => {
                self.session_terminated = match value {
                    "1" | "true" => true,
                    "0" | "false" => false,
                    other => {
                        return Err(GenError::InvalidArgument(format!(
                            "terminate_session expects 0 or 1, got '{}'",
                            other
                        )))
                    }
                };
                info!(terminated = self.session_terminated, "session termination changed");
                Ok(())
            }
            _ => {
                debug!(key, value, "forwarding runtime option");
                self.engine.set_runtime_option(key, value)
            }
        }
    }

    pub fn is_session_terminated(&self) -> bool {
        self.session_terminated || runtime::is_shut_down()
    }

    fn check_session(&self) -> Result<()> {
        if self.is_session_terminated() {
            return Err(GenError::SessionTerminated);
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        match self.unusable {
            Some(reason) => Err(GenError::InvalidState(format!(
                "generator unusable after {}; recreate it",
                reason
            ))),
            None => Ok(()),
        }
    }

    /// Record failures that end this generator's useful life.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            match err {
                GenError::OutOfMemory { .. } => {
                    warn!(error = %err, "generator out of memory");
                    self.unusable = Some("out of memory");
                }
                GenError::MaskComputation(_) => {
                    warn!(error = %err, "mask computation failed");
                    self.unusable = Some("mask computation failure");
                }
                GenError::Engine(_) => {
                    warn!(error = %err, "engine failed; terminating session");
                    self.session_terminated = true;
                }
                _ => {}
            }
        }
        result
    }
}

fn build_processors(
    model: &Model,
    params: &GeneratorParams,
    rows: usize,
    device: &Arc<dyn DeviceInterface>,
) -> Result<ProcessorChain> {
    let config = model.config();
    let s = params.search();
    let mut chain = ProcessorChain::new();
    if (s.repetition_penalty - 1.0).abs() > 1e-6 {
        chain.add_boxed(Box::new(RepetitionPenaltyProcessor::new(s.repetition_penalty)));
    }
    if s.min_length > 0 {
        chain.add_boxed(Box::new(MinLengthProcessor::new(
            s.min_length,
            &config.eos_token_id,
        )));
    }

    #[cfg(feature = "guidance")]
    if let Some(spec) = params.guidance() {
        use crate::inference::guidance::{compiler_for, GuidanceLogitsProcessor, TokenizerEnv};

        let tokenizer = model.tokenizer().ok_or_else(|| {
            GenError::invalid_argument("guidance needs a tokenizer attached to the model")
        })?;
        let eos = config
            .eos_token_id
            .primary()
            .ok_or_else(|| GenError::Config("no eos token configured".into()))?;
        let env = Arc::new(TokenizerEnv::new(Arc::clone(tokenizer), eos as u32)?);
        let compiler = compiler_for(&spec.guidance_type, model.constraint_compilers())?;
        chain.add_boxed(Box::new(GuidanceLogitsProcessor::new(
            spec,
            compiler.as_ref(),
            &env,
            rows,
            config.vocab_size,
            config.eos_token_id.as_slice(),
            Arc::clone(device),
        )?));
    }

    #[cfg(not(feature = "guidance"))]
    if let Some(spec) = params.guidance() {
        let _ = (rows, device);
        warn!(
            guidance_type = %spec.guidance_type,
            "built without the `guidance` feature; logits pass through unconstrained"
        );
    }

    Ok(chain)
}
