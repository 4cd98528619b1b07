use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a frame was turned away before inference ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    RateLimited,
    ResourceExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::CircuitOpen => "circuit-open",
            RejectReason::RateLimited => "rate-limited",
            RejectReason::ResourceExceeded => "resource-exceeded",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Preprocess error: {0}")]
    Preprocess(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Unsupported output shape: {shape:?}")]
    UnsupportedOutputShape { shape: Vec<usize> },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(RejectReason),

    #[error("Task queue full")]
    QueueFull,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// True for the variants that are turned away at an admission gate.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(self, Error::AdmissionRejected(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Error::AdmissionRejected(reason) => Some(*reason),
            _ => None,
        }
    }

    /// True for failures that should count against the circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Error::Preprocess(_)
                | Error::Inference(_)
                | Error::UnsupportedOutputShape { .. }
                | Error::Decode(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
