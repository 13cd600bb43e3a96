//! Model handle: static configuration, compute device, engine factory and the shared
//! captured-graph pool.

pub mod config;
pub mod demo;
pub mod engine;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::device::DeviceInterface;
use crate::errors::Result;
use crate::inference::graph::CapturedGraphPool;
#[cfg(feature = "guidance")]
use crate::inference::guidance::{CompilerRegistry, ConstraintCompiler};
use crate::runtime;
use crate::tokenizer::Tokenizer;

pub use config::{EosTokens, InputSpec, ModelConfig, ModelType, SearchConfig, SessionOptions};
pub use demo::{
    DemoEngineFactory, EngineCall, EngineLog, ScriptContext, ScriptedEngineFactory,
};
pub use engine::{EngineFactory, ExecutionEngine, StepInputs};

/// A loaded model. Shared by every generator created from it.
pub struct Model {
    config: Arc<ModelConfig>,
    device: Arc<dyn DeviceInterface>,
    factory: Arc<dyn EngineFactory>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    graph_pool: Arc<CapturedGraphPool>,
    #[cfg(feature = "guidance")]
    compilers: CompilerRegistry,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("model_type", &self.config.model_type)
            .field("vocab_size", &self.config.vocab_size)
            .field("device", &self.device.device_type())
            .field("tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl Model {
    /// Validate `config` and bind the model to the shared runtime device named in
    /// `config.session_options.device`.
    pub fn new(config: ModelConfig, factory: impl EngineFactory + 'static) -> Result<Self> {
        let device = runtime::device(config.session_options.device)?;
        Self::with_device(config, factory, device)
    }

    /// Bind the model to an explicit device interface instead of the runtime's shared one.
    pub fn with_device(
        config: ModelConfig,
        factory: impl EngineFactory + 'static,
        device: Arc<dyn DeviceInterface>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            model_type = ?config.model_type,
            vocab_size = config.vocab_size,
            device = %device.device_type(),
            "model ready"
        );
        Ok(Self {
            config: Arc::new(config),
            device,
            factory: Arc::new(factory),
            tokenizer: None,
            graph_pool: Arc::new(CapturedGraphPool::new()),
            #[cfg(feature = "guidance")]
            compilers: CompilerRegistry::new(),
        })
    }

    /// Attach the tokenizer that constrained decoding uses.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Register a compiler for a custom guidance type. Built-in types (`regex`,
    /// `choice`) can be overridden this way.
    #[cfg(feature = "guidance")]
    pub fn register_constraint_compiler(
        mut self,
        guidance_type: impl Into<String>,
        compiler: Arc<dyn ConstraintCompiler>,
    ) -> Self {
        self.compilers.insert(guidance_type.into(), compiler);
        self
    }

    #[cfg(feature = "guidance")]
    pub fn constraint_compilers(&self) -> &CompilerRegistry {
        &self.compilers
    }

    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn DeviceInterface> {
        &self.device
    }

    pub fn factory(&self) -> &Arc<dyn EngineFactory> {
        &self.factory
    }

    pub fn tokenizer(&self) -> Option<&Arc<dyn Tokenizer>> {
        self.tokenizer.as_ref()
    }

    pub fn graph_pool(&self) -> &Arc<CapturedGraphPool> {
        &self.graph_pool
    }
}
