//! Work items and per-frame results

use kestrel_core::{Detection, Error, Frame, Result};
use std::time::Duration;

/// A frame submitted for detection. Owned by the submitter until it is
/// queued, then by the worker that dequeues it.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: u64,
    pub frame: Frame,
    pub target_width: u32,
    pub target_height: u32,
}

/// Outcome of one task
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub id: u64,
    /// The source frame, for rendering
    pub frame: Frame,
    pub outcome: Result<Vec<Detection>>,
    /// Admission to completion
    pub latency: Duration,
    /// Processed on the submitter's path because the queue was full
    pub inline: bool,
}

impl FrameResult {
    pub fn frame_number(&self) -> u64 {
        self.frame.frame_number()
    }

    pub fn timestamp(&self) -> Duration {
        self.frame.timestamp()
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn detections(&self) -> Option<&[Detection]> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.outcome.as_ref().err()
    }

    /// Turned away at an admission gate, no inference ran
    pub fn was_rejected(&self) -> bool {
        self.error().map_or(false, Error::is_admission_rejection)
    }
}

/// What [`Pipeline::submit`](crate::Pipeline::submit) did with a frame
#[derive(Debug)]
pub enum Submission {
    /// Queued; the result arrives on the result channel
    Queued { id: u64 },
    /// Queue was full; processed on the caller's path. Never sent to the
    /// result channel.
    Inline(FrameResult),
}

impl Submission {
    pub fn id(&self) -> u64 {
        match self {
            Submission::Queued { id } => *id,
            Submission::Inline(result) => result.id,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Submission::Inline(_))
    }
}
