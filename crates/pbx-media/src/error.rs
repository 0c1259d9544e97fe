//! Error types for the audio engine.

use thiserror::Error;

/// Result alias for audio engine operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Failures from WAV I/O, codec conversion, and prompt resolution
/// (§4.5, §7 `MediaError`).
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("WAV decode failed: {0}")]
    WavDecode(#[from] hound::Error),

    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("prompt {0:?} not found and no synthetic fallback is defined")]
    PromptNotFound(String),
}

impl MediaError {
    /// Coarse category, useful for metrics/logging grouping.
    pub fn category(&self) -> &'static str {
        match self {
            MediaError::WavDecode(_) | MediaError::UnsupportedFormat(_) => "wav",
            MediaError::Io(_) => "io",
            MediaError::PromptNotFound(_) => "prompt",
        }
    }
}
