//! Error types for the duplex audio core.

use thiserror::Error;

/// Failures surfaced by the audio core.
///
/// Only construction-time configuration problems and malformed caller buffers
/// are reported here. Underruns and scratch-buffer overflows are recovered
/// inside the pipeline and show up in [`super::FilterStats`] instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("invalid audio configuration: {0}")]
    Configuration(String),

    #[error("invalid input buffer: {0}")]
    InvalidInput(String),
}

pub type AudioResult<T> = Result<T, AudioError>;

impl AudioError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        AudioError::Configuration(msg.into())
    }

    pub(crate) fn input(msg: impl Into<String>) -> Self {
        AudioError::InvalidInput(msg.into())
    }
}
