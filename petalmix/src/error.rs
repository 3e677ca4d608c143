//! Error types for PetalMix

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PetalMixError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, PetalMixError>;
