//! Error taxonomy shared by the filter, convolution and audio layers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpsamplerError {
    /// Malformed or inconsistent filter sidecar.
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("size mismatch: {what} (expected {expected}, got {actual})")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("filter not found: {0}")]
    FilterNotFound(String),

    /// Hardware parameter rejection.
    #[error("device error on '{device}': {message}")]
    Device { device: String, message: String },

    /// XRUN or interrupt. Retried after recovery.
    #[error("recoverable stream error: {0}")]
    RecoverableStream(String),

    #[error("fatal stream error: {0}")]
    FatalStream(String),
}

impl UpsamplerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn device(device: &str, message: impl std::fmt::Display) -> Self {
        Self::Device {
            device: device.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UpsamplerError>;
