//! Execution-engine contract.
//!
//! The engine turns the tokens of one step into a device-resident logits block. How
//! the weights run is the engine's business; the generator only relies on the shape of
//! the result and on the engine issuing its work on the generator's device stream.

use std::sync::Arc;

use tracing::debug;

use crate::device::{DeviceInterface, DeviceSpan};
use crate::errors::Result;
use crate::inference::graph::CapturedGraph;
use crate::inference::params::{GeneratorParams, ModalityInputs, NamedInput};

/// Everything one engine call consumes.
pub struct StepInputs<'a> {
    /// `[rows, new_tokens]` row-major token ids for the positions not yet processed.
    pub input_ids: &'a DeviceSpan<i32>,
    pub rows: usize,
    pub new_tokens: usize,
    /// Sequence length once these tokens are processed.
    pub total_length: usize,
    pub modality: &'a ModalityInputs,
    pub extra_inputs: &'a [NamedInput],
    /// Present when the step replays a captured graph; outputs must go to its buffers.
    pub graph: Option<&'a CapturedGraph>,
}

pub trait ExecutionEngine: Send {
    /// Run one step and return `[rows, vocab_size]` logits for the last position of
    /// every row, resident on the generator's device.
    fn run(&mut self, inputs: &StepInputs<'_>) -> Result<DeviceSpan<f32>>;

    /// Drop cached state past `length` processed positions.
    fn rewind_to(&mut self, length: usize) -> Result<()> {
        let _ = length;
        Ok(())
    }

    /// Called once when every row of the generator is done.
    fn finalize(&mut self) {}

    /// Backend-specific tuning. Must not change output shapes or types.
    fn set_runtime_option(&mut self, key: &str, value: &str) -> Result<()> {
        debug!(key, value, "runtime option ignored by engine");
        Ok(())
    }
}

/// Builds one engine per generator.
pub trait EngineFactory: Send + Sync {
    fn create_engine(
        &self,
        params: &GeneratorParams,
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Box<dyn ExecutionEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(&GeneratorParams, Arc<dyn DeviceInterface>) -> Result<Box<dyn ExecutionEngine>>
        + Send
        + Sync,
{
    fn create_engine(
        &self,
        params: &GeneratorParams,
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Box<dyn ExecutionEngine>> {
        self(params, device)
    }
}
