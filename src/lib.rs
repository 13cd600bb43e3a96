//! # genai-oxidized
//!
//! Token-generation runtime: drives an external execution engine through the
//! append / compute-logits / select loop, one step at a time.
//!
//! ## Architecture
//!
//! - **Devices**: one [`device::DeviceInterface`] per backend; buffers are
//!   [`device::DeviceSpan`]s bound to a stream and a memory budget
//! - **Model**: static configuration plus an [`model::EngineFactory`] that creates one
//!   execution engine per generator
//! - **Generator**: per-request state machine over token sequences, search policy and
//!   a chain of logits processors
//! - **Guidance** (feature `guidance`): per-row constraint engines whose token masks are
//!   computed on the rayon pool while the engine runs, then merged into the logits on
//!   the compute device

pub mod device;
pub mod errors;
pub mod inference;
pub mod kernels;
pub mod model;
pub mod runtime;
pub mod tokenizer;
pub mod utils;

pub use device::{create_device, DeviceInterface, DeviceOptions, DeviceSpan, DeviceType};
pub use errors::{GenError, Result};
pub use inference::{
    GenerationToken, Generator, GeneratorParams, NamedTensors, StreamGenerator, Tensor,
};
pub use kernels::{argmax, softmax, TokenMask};
pub use model::{
    DemoEngineFactory, EngineFactory, ExecutionEngine, Model, ModelConfig, ModelType,
    ScriptedEngineFactory,
};
pub use tokenizer::{ByteTokenizer, HfTokenizer, Tokenizer};
