//! Frame sources feeding the detector

use async_trait::async_trait;
use kestrel_core::{Error, Frame, InputSource, Result};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Produces frames for [`Detector::detect`](crate::Detector::detect).
///
/// Decoding and capture live behind this trait; a source yields `None`
/// when it is exhausted and an error for a frame it could not produce.
#[async_trait]
pub trait FrameSource: Send {
    fn input(&self) -> &InputSource;

    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Frames decoded up front, e.g. a still image or a short clip.
#[derive(Debug)]
pub struct VecFrameSource {
    input: InputSource,
    frames: VecDeque<Frame>,
}

impl VecFrameSource {
    pub fn new(input: InputSource, frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            input,
            frames: frames.into_iter().collect(),
        }
    }

    /// A single still image
    pub fn single(input: InputSource, frame: Frame) -> Self {
        Self::new(input, [frame])
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl FrameSource for VecFrameSource {
    fn input(&self) -> &InputSource {
        &self.input
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.frames.pop_front().map(Ok)
    }
}

/// Frames pushed from a capture thread.
///
/// The source ends when every [`FrameSender`] has been dropped.
#[derive(Debug)]
pub struct ChannelFrameSource {
    input: InputSource,
    rx: mpsc::Receiver<Result<Frame>>,
}

/// Producer half of a [`ChannelFrameSource`]
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Result<Frame>>,
}

/// Bounded channel between a capture loop and the detector.
pub fn frame_channel(input: InputSource, capacity: usize) -> (FrameSender, ChannelFrameSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx }, ChannelFrameSource { input, rx })
}

impl FrameSender {
    pub async fn send(&self, frame: Result<Frame>) -> Result<()> {
        self.tx.send(frame).await.map_err(|_| Error::ShutDown)
    }

    /// For capture loops running on plain threads. Must not be called
    /// from async context.
    pub fn blocking_send(&self, frame: Result<Frame>) -> Result<()> {
        self.tx.blocking_send(frame).map_err(|_| Error::ShutDown)
    }

    /// Fails with `QueueFull` instead of waiting; live captures usually
    /// prefer to skip a frame.
    pub fn try_send(&self, frame: Result<Frame>) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ShutDown,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    fn input(&self) -> &InputSource {
        &self.input
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await
    }
}
