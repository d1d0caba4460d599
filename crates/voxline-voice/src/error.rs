//! Error types for the voice pipeline.

use thiserror::Error;
use voxline_core::CoreError;

/// Result type alias for call-pipeline operations.
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while orchestrating a call.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl From<CoreError> for CallError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Store(e) | CoreError::StoreUnavailable(e) => CallError::Store(e),
            CoreError::Serialization(e) => CallError::Store(e.to_string()),
            CoreError::Generation(e) => CallError::Generation(e),
            CoreError::Config(e) => CallError::Config(e),
        }
    }
}
