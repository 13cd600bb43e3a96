//! Static model configuration (the `genai_config.json` equivalent).

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, ElementType};
use crate::errors::{GenError, Result};

/// Architecture family; decides which input modality a generator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Decoder-only language model driven by token ids.
    #[default]
    Decoder,
    /// Encoder-decoder speech model driven by audio features.
    Whisper,
}

impl ModelType {
    pub fn is_audio(self) -> bool {
        self == ModelType::Whisper
    }
}

/// One entry of the model's declared input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub element_type: ElementType,
    /// Per-dimension size; `None` marks a dynamic dimension.
    pub shape: Vec<Option<usize>>,
    #[serde(default)]
    pub required: bool,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, element_type: ElementType, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            element_type,
            shape,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.shape.iter().any(Option::is_none)
    }

    pub fn matches_shape(&self, shape: &[usize]) -> bool {
        self.shape.len() == shape.len()
            && self
                .shape
                .iter()
                .zip(shape)
                .all(|(want, got)| want.map_or(true, |w| w == *got))
    }
}

/// `eos_token_id` may be a single id or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosTokens {
    One(i32),
    Many(Vec<i32>),
}

impl EosTokens {
    pub fn as_slice(&self) -> &[i32] {
        match self {
            EosTokens::One(id) => std::slice::from_ref(id),
            EosTokens::Many(ids) => ids,
        }
    }

    pub fn contains(&self, token: i32) -> bool {
        self.as_slice().contains(&token)
    }

    /// The id the guidance engine treats as end of output.
    pub fn primary(&self) -> Option<i32> {
        self.as_slice().first().copied()
    }
}

impl Default for EosTokens {
    fn default() -> Self {
        EosTokens::One(2)
    }
}

/// Search defaults; copied into every [`crate::inference::GeneratorParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub batch_size: usize,
    pub num_beams: usize,
    pub max_length: usize,
    pub min_length: usize,
    pub do_sample: bool,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub random_seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_beams: 1,
            max_length: 128,
            min_length: 0,
            do_sample: false,
            top_k: 50,
            top_p: 1.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            random_seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub enable_graph_capture: bool,
    pub device: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: ModelType,
    pub vocab_size: usize,
    pub context_length: usize,
    #[serde(default)]
    pub eos_token_id: EosTokens,
    #[serde(default)]
    pub pad_token_id: i32,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub session_options: SessionOptions,
}

impl ModelConfig {
    /// Decoder config with default search options, eos 2 and pad 0.
    pub fn decoder(vocab_size: usize, context_length: usize) -> Self {
        Self {
            model_type: ModelType::Decoder,
            vocab_size,
            context_length,
            eos_token_id: EosTokens::default(),
            pad_token_id: 0,
            inputs: Vec::new(),
            search: SearchConfig {
                max_length: context_length.min(SearchConfig::default().max_length),
                ..SearchConfig::default()
            },
            session_options: SessionOptions::default(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GenError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|spec| spec.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(GenError::Config("vocab_size must be positive".into()));
        }
        if self.context_length == 0 {
            return Err(GenError::Config("context_length must be positive".into()));
        }
        let eos = self.eos_token_id.as_slice();
        if eos.is_empty() {
            return Err(GenError::Config("eos_token_id must name at least one token".into()));
        }
        if let Some(bad) = eos
            .iter()
            .chain(std::iter::once(&self.pad_token_id))
            .find(|&&id| id < 0 || id as usize >= self.vocab_size)
        {
            return Err(GenError::Config(format!(
                "token id {} outside vocabulary of {}",
                bad, self.vocab_size
            )));
        }
        let mut names = HashSet::new();
        for spec in &self.inputs {
            if !names.insert(spec.name.as_str()) {
                return Err(GenError::Config(format!("duplicate input '{}'", spec.name)));
            }
        }
        if self.search.max_length > self.context_length {
            return Err(GenError::Config(format!(
                "search.max_length {} exceeds context_length {}",
                self.search.max_length, self.context_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_json_with_defaults() {
        let config = ModelConfig::from_json_str(
            r#"{ "vocab_size": 32, "context_length": 16, "eos_token_id": [2, 3] }"#,
        )
        .unwrap();
        assert_eq!(config.model_type, ModelType::Decoder);
        assert_eq!(config.eos_token_id.as_slice(), &[2, 3]);
        assert_eq!(config.search.batch_size, 1);
        assert!(!config.session_options.enable_graph_capture);
    }

    #[test]
    fn parses_audio_schema() {
        let config = ModelConfig::from_json_str(
            r#"{
                "model_type": "whisper",
                "vocab_size": 64,
                "context_length": 32,
                "eos_token_id": 5,
                "search": { "max_length": 32 },
                "session_options": { "device": "cuda", "enable_graph_capture": true },
                "inputs": [
                    { "name": "input_features", "element_type": "f32",
                      "shape": [null, 80, 3000], "required": true }
                ]
            }"#,
        )
        .unwrap();
        assert!(config.model_type.is_audio());
        assert_eq!(config.session_options.device, DeviceType::Cuda);
        let spec = config.input("input_features").unwrap();
        assert!(spec.is_dynamic());
        assert!(spec.matches_shape(&[2, 80, 3000]));
        assert!(!spec.matches_shape(&[2, 40, 3000]));
    }

    #[test]
    fn validate_rejects_bad_configs() {
        let mut config = ModelConfig::decoder(8, 8);
        config.eos_token_id = EosTokens::One(9);
        assert!(config.validate().is_err());

        let mut config = ModelConfig::decoder(8, 8);
        config.search.max_length = 9;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::decoder(8, 8);
        config.inputs = vec![
            InputSpec::new("mask", ElementType::I32, vec![None]),
            InputSpec::new("mask", ElementType::I32, vec![None]),
        ];
        assert!(matches!(config.validate(), Err(GenError::Config(_))));
    }
}
