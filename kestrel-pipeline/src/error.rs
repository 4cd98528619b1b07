//! Error types for kestrel-pipeline

use kestrel_core::Error as CoreError;
use kestrel_vision::VisionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vision error: {0}")]
    Vision(#[from] VisionError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Core(inner) => inner,
            PipelineError::Vision(inner) => inner.into(),
            PipelineError::Io(e) => CoreError::Io(e.to_string()),
            other => CoreError::Configuration(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
