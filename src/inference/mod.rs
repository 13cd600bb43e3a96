//! Generation: parameters, the generator state machine, search, logits processors
//! and constrained decoding.

pub mod generator;
pub mod graph;
#[cfg(feature = "guidance")]
pub mod guidance;
pub mod logit_processors;
pub mod params;
pub mod search;
pub mod sequences;
pub mod streaming;

pub use generator::Generator;
pub use graph::{CapturedGraph, CapturedGraphPool};
pub use logit_processors::{
    LogitsContext, LogitsProcessor, MinLengthProcessor, ProcessorChain,
    RepetitionPenaltyProcessor,
};
pub use params::{
    AudioInputs, GeneratorParams, GuidanceSpec, ModalityInputs, NamedInput, NamedTensors,
    Tensor, TensorData,
};
pub use search::{create_search, GreedySearch, SamplingSearch, SearchPolicy};
pub use sequences::Sequences;
pub use streaming::{GenerationToken, StreamGenerator};
