//! Central error types for genai-oxidized.

use thiserror::Error;

use crate::device::DeviceType;

#[derive(Error, Debug)]
pub enum GenError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Session was terminated")]
    SessionTerminated,

    #[error("Device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch {
        expected: DeviceType,
        actual: DeviceType,
    },

    #[error("Mask computation failed: {0}")]
    MaskComputation(String),

    #[error("Execution engine error: {0}")]
    Engine(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        GenError::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        GenError::InvalidState(msg.into())
    }

    /// Caller-side mistakes that leave the generator usable once the call
    /// sequence is corrected.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GenError::InvalidArgument(_) | GenError::InvalidState(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(GenError::invalid_state("x").is_recoverable());
        assert!(GenError::invalid_argument("x").is_recoverable());
        assert!(!GenError::SessionTerminated.is_recoverable());
        assert!(!GenError::OutOfMemory {
            requested: 1,
            available: 0
        }
        .is_recoverable());
    }

    #[test]
    fn device_mismatch_message() {
        let e = GenError::DeviceMismatch {
            expected: DeviceType::Cpu,
            actual: DeviceType::Cuda,
        };
        assert_eq!(e.to_string(), "Device mismatch: expected cpu, got cuda");
    }
}
