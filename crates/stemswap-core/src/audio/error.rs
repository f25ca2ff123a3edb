//! Audio output error types

use thiserror::Error;

/// Errors raised while opening or running the output device
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No default audio output device")]
    NoDefaultDevice,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Failed to query the device configuration
    #[error("Failed to get device config: {0}")]
    ConfigError(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

/// Result type for audio operations
pub type AudioResult<T> = Result<T, AudioError>;
