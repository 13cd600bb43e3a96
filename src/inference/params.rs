//! Generation parameters: one request's search options, batch shape, device binding,
//! modality inputs and extra named tensors.
//!
//! A [`crate::inference::Generator`] takes its parameters behind an `Arc`, so they are
//! frozen from that point on.

use std::sync::Arc;

use tracing::debug;

use crate::device::{DeviceSpan, DeviceType, ElementType};
use crate::errors::{GenError, Result};
use crate::model::{InputSpec, Model, ModelConfig, SearchConfig};

/// Device data of one named tensor.
#[derive(Debug, Clone)]
pub enum TensorData {
    F32(DeviceSpan<f32>),
    I32(DeviceSpan<i32>),
    I64(DeviceSpan<i64>),
    U32(DeviceSpan<u32>),
    U8(DeviceSpan<u8>),
}

macro_rules! tensor_data_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<DeviceSpan<$ty>> for TensorData {
            fn from(span: DeviceSpan<$ty>) -> Self {
                TensorData::$variant(span)
            }
        })*
    };
}

tensor_data_from!(f32 => F32, i32 => I32, i64 => I64, u32 => U32, u8 => U8);

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::I32(_) => ElementType::I32,
            TensorData::I64(_) => ElementType::I64,
            TensorData::U32(_) => ElementType::U32,
            TensorData::U8(_) => ElementType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(s) => s.len(),
            TensorData::I32(s) => s.len(),
            TensorData::I64(s) => s.len(),
            TensorData::U32(s) => s.len(),
            TensorData::U8(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            TensorData::F32(s) => s.device_type(),
            TensorData::I32(s) => s.device_type(),
            TensorData::I64(s) => s.device_type(),
            TensorData::U32(s) => s.device_type(),
            TensorData::U8(s) => s.device_type(),
        }
    }
}

/// A shaped device tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Fails with InvalidArgument when the element count does not match `shape`.
    pub fn new(shape: Vec<usize>, data: impl Into<TensorData>) -> Result<Self> {
        let data = data.into();
        let count: usize = shape.iter().product();
        if count != data.len() {
            return Err(GenError::InvalidArgument(format!(
                "shape {:?} needs {} elements, data has {}",
                shape,
                count,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn as_i32(&self) -> Option<&DeviceSpan<i32>> {
        match &self.data {
            TensorData::I32(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&DeviceSpan<f32>> {
        match &self.data {
            TensorData::F32(s) => Some(s),
            _ => None,
        }
    }
}

/// Caller-supplied tensors in the order they were given.
pub type NamedTensors = Vec<(String, Tensor)>;

/// An extra input bound to the engine by name at execution time.
#[derive(Debug, Clone)]
pub struct NamedInput {
    pub name: String,
    pub tensor: Arc<Tensor>,
}

/// Speech-model inputs.
#[derive(Debug, Clone, Default)]
pub struct AudioInputs {
    /// `[batch, mels, frames]` f32 features. Required before a generator is built.
    pub input_features: Option<Arc<Tensor>>,
    /// `[heads, 2]` (layer, head) pairs used for cross-attention alignment.
    pub alignment_heads: Option<Arc<Tensor>>,
    /// Decoder prompt, appended when the generator is built.
    pub decoder_input_ids: Vec<i32>,
}

/// Primary inputs; the variant is fixed by the model type.
#[derive(Debug, Clone)]
pub enum ModalityInputs {
    Tokens { aux_input_ids: Vec<i32> },
    Audio(AudioInputs),
}

impl ModalityInputs {
    fn for_config(config: &ModelConfig) -> Self {
        if config.model_type.is_audio() {
            ModalityInputs::Audio(AudioInputs::default())
        } else {
            ModalityInputs::Tokens {
                aux_input_ids: Vec::new(),
            }
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, ModalityInputs::Audio(_))
    }

    /// Token ids appended automatically when the generator is built.
    pub fn prompt_ids(&self) -> &[i32] {
        match self {
            ModalityInputs::Tokens { aux_input_ids } => aux_input_ids,
            ModalityInputs::Audio(audio) => &audio.decoder_input_ids,
        }
    }

    fn prompt_ids_mut(&mut self) -> &mut Vec<i32> {
        match self {
            ModalityInputs::Tokens { aux_input_ids } => aux_input_ids,
            ModalityInputs::Audio(audio) => &mut audio.decoder_input_ids,
        }
    }
}

/// Constraint request: an engine type (`regex`, `choice`, or a registered name) plus
/// its grammar text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceSpec {
    pub guidance_type: String,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct GeneratorParams {
    config: Arc<ModelConfig>,
    search: SearchConfig,
    device_type: DeviceType,
    graph_capture_supported: bool,
    use_graph_capture: bool,
    max_batch_size: usize,
    inputs: ModalityInputs,
    extra_inputs: Vec<NamedInput>,
    guidance: Option<GuidanceSpec>,
}

impl GeneratorParams {
    pub fn new(model: &Model) -> Self {
        let config = Arc::clone(model.config());
        let device = model.device();
        Self {
            search: config.search.clone(),
            device_type: device.device_type(),
            graph_capture_supported: device.supports_graph_capture()
                && config.session_options.enable_graph_capture,
            use_graph_capture: false,
            max_batch_size: 0,
            inputs: ModalityInputs::for_config(&config),
            extra_inputs: Vec::new(),
            guidance: None,
            config,
        }
    }

    pub fn config(&self) -> &Arc<ModelConfig> {
        &self.config
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn search(&self) -> &SearchConfig {
        &self.search
    }

    /// Rows the generator tracks: one per beam of every batch entry.
    pub fn batch_beam_size(&self) -> usize {
        self.search.batch_size * self.search.num_beams
    }

    pub fn use_graph_capture(&self) -> bool {
        self.use_graph_capture
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn inputs(&self) -> &ModalityInputs {
        &self.inputs
    }

    pub fn extra_inputs(&self) -> &[NamedInput] {
        &self.extra_inputs
    }

    pub fn guidance(&self) -> Option<&GuidanceSpec> {
        self.guidance.as_ref()
    }

    pub fn set_guidance(&mut self, guidance_type: impl Into<String>, data: impl Into<String>) {
        self.guidance = Some(GuidanceSpec {
            guidance_type: guidance_type.into(),
            data: data.into(),
        });
    }

    pub fn clear_guidance(&mut self) {
        self.guidance = None;
    }

    /// Set a numeric search option by its config name.
    pub fn set_search_option(&mut self, name: &str, value: f64) -> Result<()> {
        let count = || {
            if value < 0.0 || value.fract() != 0.0 {
                Err(GenError::InvalidArgument(format!(
                    "{} must be a non-negative integer, got {}",
                    name, value
                )))
            } else {
                Ok(value as usize)
            }
        };
        match name {
            "batch_size" => self.search.batch_size = count()?,
            "num_beams" => self.search.num_beams = count()?,
            "max_length" => self.search.max_length = count()?,
            "min_length" => self.search.min_length = count()?,
            "top_k" => self.search.top_k = count()?,
            "random_seed" => self.search.random_seed = Some(count()? as u64),
            "top_p" => self.search.top_p = value as f32,
            "temperature" => self.search.temperature = value as f32,
            "repetition_penalty" => self.search.repetition_penalty = value as f32,
            other => {
                return Err(GenError::InvalidArgument(format!(
                    "unknown search option '{}'",
                    other
                )))
            }
        }
        self.recheck_graph_capture();
        Ok(())
    }

    pub fn set_search_bool(&mut self, name: &str, value: bool) -> Result<()> {
        match name {
            "do_sample" => {
                self.search.do_sample = value;
                Ok(())
            }
            other => Err(GenError::InvalidArgument(format!(
                "unknown boolean search option '{}'",
                other
            ))),
        }
    }

    /// Request the replay-optimized path for up to `max_batch_size` rows.
    ///
    /// Declines (and disables capture) when the backend or session options do not allow
    /// it, when the current batch is larger than `max_batch_size`, or when an extra
    /// input has a dynamic shape.
    pub fn try_graph_capture(&mut self, max_batch_size: usize) -> bool {
        let decline = if !self.graph_capture_supported {
            Some("not supported by backend or session options")
        } else if max_batch_size == 0 {
            Some("max batch size is zero")
        } else if self.batch_beam_size() > max_batch_size {
            Some("batch exceeds captured maximum")
        } else if self.has_dynamic_extra_inputs() {
            Some("dynamic-shape extra input")
        } else {
            None
        };

        match decline {
            Some(reason) => {
                debug!(
                    device = %self.device_type,
                    max_batch_size,
                    batch = self.batch_beam_size(),
                    reason,
                    "graph capture declined"
                );
                self.use_graph_capture = false;
                self.max_batch_size = 0;
                false
            }
            None => {
                debug!(device = %self.device_type, max_batch_size, "graph capture enabled");
                self.use_graph_capture = true;
                self.max_batch_size = max_batch_size;
                true
            }
        }
    }

    /// Withdraw an earlier capture approval that the current batch or inputs no longer
    /// satisfy.
    fn recheck_graph_capture(&mut self) {
        if !self.use_graph_capture {
            return;
        }
        let reason = if self.batch_beam_size() > self.max_batch_size {
            "batch exceeds captured maximum"
        } else if self.has_dynamic_extra_inputs() {
            "dynamic-shape extra input"
        } else {
            return;
        };
        debug!(
            device = %self.device_type,
            max_batch_size = self.max_batch_size,
            batch = self.batch_beam_size(),
            reason,
            "graph capture withdrawn"
        );
        self.use_graph_capture = false;
        self.max_batch_size = 0;
    }

    fn has_dynamic_extra_inputs(&self) -> bool {
        self.extra_inputs.iter().any(|input| {
            self.config
                .input(&input.name)
                .map_or(true, InputSpec::is_dynamic)
        })
    }

    /// Validate named tensors against the model's input schema and bind them.
    ///
    /// `input_ids` goes to the prompt slot of the modality, `input_features` and
    /// `alignment_heads` to the audio slots, anything else to the extra inputs. On error
    /// nothing is changed.
    pub fn set_inputs(&mut self, tensors: NamedTensors) -> Result<()> {
        let mut inputs = self.inputs.clone();
        let mut extra = self.extra_inputs.clone();

        for (name, tensor) in tensors {
            if let Some(spec) = self.config.input(&name) {
                check_against_spec(spec, &tensor)?;
            }
            match name.as_str() {
                "input_ids" => {
                    *inputs.prompt_ids_mut() = self.prompt_ids_from(&tensor)?;
                }
                "input_features" | "alignment_heads" => {
                    let ModalityInputs::Audio(audio) = &mut inputs else {
                        return Err(GenError::InvalidArgument(format!(
                            "'{}' is an audio input but the model type is {:?}",
                            name, self.config.model_type
                        )));
                    };
                    self.check_device(&name, &tensor)?;
                    if name == "input_features" {
                        check_audio_features(&tensor)?;
                        audio.input_features = Some(Arc::new(tensor));
                    } else {
                        check_alignment_heads(&tensor)?;
                        audio.alignment_heads = Some(Arc::new(tensor));
                    }
                }
                _ => {
                    if self.config.input(&name).is_none() {
                        return Err(GenError::InvalidArgument(format!(
                            "model declares no input named '{}'",
                            name
                        )));
                    }
                    self.check_device(&name, &tensor)?;
                    let tensor = Arc::new(tensor);
                    match extra.iter_mut().find(|input| input.name == name) {
                        Some(slot) => slot.tensor = tensor,
                        None => extra.push(NamedInput { name, tensor }),
                    }
                }
            }
        }

        if let ModalityInputs::Audio(audio) = &inputs {
            if audio.input_features.is_none() {
                return Err(GenError::invalid_argument(
                    "audio models require 'input_features'",
                ));
            }
        }
        for spec in self.config.inputs.iter().filter(|spec| spec.required) {
            let present = match spec.name.as_str() {
                "input_ids" => !inputs.prompt_ids().is_empty(),
                "input_features" | "alignment_heads" => true,
                name => extra.iter().any(|input| input.name == name),
            };
            if !present {
                return Err(GenError::InvalidArgument(format!(
                    "required input '{}' is missing",
                    spec.name
                )));
            }
        }

        self.inputs = inputs;
        self.extra_inputs = extra;
        self.recheck_graph_capture();
        Ok(())
    }

    fn prompt_ids_from(&self, tensor: &Tensor) -> Result<Vec<i32>> {
        let span = tensor
            .as_i32()
            .ok_or_else(|| GenError::invalid_argument("input_ids must be i32"))?;
        let batch = self.search.batch_size;
        let shape = tensor.shape();
        let shape_ok = match shape {
            [_] => batch == 1,
            [rows, _] => *rows == batch,
            _ => false,
        };
        if !shape_ok {
            return Err(GenError::InvalidArgument(format!(
                "input_ids shape {:?} does not match batch size {}",
                shape, batch
            )));
        }
        let per_row = span.len() / batch.max(1);
        if per_row > self.search.max_length {
            return Err(GenError::InvalidArgument(format!(
                "input_ids length {} exceeds max_length {}",
                per_row, self.search.max_length
            )));
        }
        Ok(span.to_cpu())
    }

    fn check_device(&self, name: &str, tensor: &Tensor) -> Result<()> {
        let actual = tensor.data().device_type();
        if actual != self.device_type {
            debug!(input = name, expected = %self.device_type, %actual, "input on wrong device");
            return Err(GenError::DeviceMismatch {
                expected: self.device_type,
                actual,
            });
        }
        Ok(())
    }
}

fn check_against_spec(spec: &InputSpec, tensor: &Tensor) -> Result<()> {
    if spec.element_type != tensor.element_type() {
        return Err(GenError::InvalidArgument(format!(
            "input '{}' expects {}, got {}",
            spec.name,
            spec.element_type,
            tensor.element_type()
        )));
    }
    if !spec.matches_shape(tensor.shape()) {
        return Err(GenError::InvalidArgument(format!(
            "input '{}' expects shape {:?}, got {:?}",
            spec.name,
            spec.shape,
            tensor.shape()
        )));
    }
    Ok(())
}

fn check_audio_features(tensor: &Tensor) -> Result<()> {
    if tensor.element_type() != ElementType::F32 || tensor.shape().len() != 3 {
        return Err(GenError::InvalidArgument(format!(
            "input_features must be f32 [batch, mels, frames], got {} {:?}",
            tensor.element_type(),
            tensor.shape()
        )));
    }
    Ok(())
}

fn check_alignment_heads(tensor: &Tensor) -> Result<()> {
    if tensor.element_type() != ElementType::I32
        || !matches!(tensor.shape(), [_, 2])
    {
        return Err(GenError::InvalidArgument(format!(
            "alignment_heads must be i32 [heads, 2], got {} {:?}",
            tensor.element_type(),
            tensor.shape()
        )));
    }
    Ok(())
}
