//! Error taxonomy for the camera pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CameraError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// No camera matches the selector, the device could not be opened, or the
    /// lifecycle the session was meant to bind to is already destroyed.
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    /// A frame could not be converted into a pixel buffer.
    #[error("frame decode failed: {0}")]
    DecodeFailure(String),

    /// Work was submitted to an executor that has already shut down.
    #[error("camera executor has been shut down")]
    ExecutorShutdown,

    #[error("configuration error: {0}")]
    Config(String),
}

impl CameraError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::CameraUnavailable(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::DecodeFailure(msg.into())
    }
}

impl From<jpeg_decoder::Error> for CameraError {
    fn from(err: jpeg_decoder::Error) -> Self {
        Self::DecodeFailure(err.to_string())
    }
}

impl From<config::ConfigError> for CameraError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
