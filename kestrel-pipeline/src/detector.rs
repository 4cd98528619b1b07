//! High level detector over an engine, a processor and a pipeline

use crate::config::PipelineConfig;
use crate::error::Result as PipelineResult;
use crate::pool::Pipeline;
use crate::source::FrameSource;
use crate::task::{FrameResult, Submission};
use image::RgbImage;
use kestrel_core::{Detection, Error, Frame, InputSource, Result};
use kestrel_vision::{draw_detections, DetectionOptions, DetectorConfig, FrameProcessor, SharedEngine, VisionError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for an outstanding result before re-checking whether
/// it was dropped by backpressure.
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Detections for a still image
#[derive(Debug, Clone)]
pub struct ImageResult {
    pub detections: Vec<Detection>,
    pub image: Frame,
}

/// Detections for one frame of a video or stream
#[derive(Debug, Clone)]
pub struct VideoFrameResult {
    pub frame_number: u64,
    pub timestamp: Duration,
    pub detections: Vec<Detection>,
    pub image: Frame,
}

/// Per-frame callback, chosen by the kind of result the caller wants.
pub enum DetectionCallback {
    OnImageResult(Box<dyn FnMut(&ImageResult) + Send>),
    OnVideoFrameResult(Box<dyn FnMut(&VideoFrameResult) + Send>),
}

impl DetectionCallback {
    fn invoke(&mut self, result: &VideoFrameResult) {
        match self {
            DetectionCallback::OnImageResult(callback) => callback(&ImageResult {
                detections: result.detections.clone(),
                image: result.image.clone(),
            }),
            DetectionCallback::OnVideoFrameResult(callback) => callback(result),
        }
    }
}

impl std::fmt::Debug for DetectionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionCallback::OnImageResult(_) => f.write_str("OnImageResult"),
            DetectionCallback::OnVideoFrameResult(_) => f.write_str("OnVideoFrameResult"),
        }
    }
}

/// Everything one [`Detector::detect`] run produced, in frame order.
#[derive(Debug, Clone)]
pub struct DetectionResults {
    pub input: InputSource,
    /// Detections of every successful frame, flattened
    pub detections: Vec<Detection>,
    pub video_results: Vec<VideoFrameResult>,
    /// Frames whose detection failed or was rejected at admission
    pub failed_frames: Vec<(u64, Error)>,
    /// Frames the source could not produce
    pub source_errors: Vec<Error>,
    /// Results discarded by the backpressure policy
    pub dropped_frames: u64,
}

impl DetectionResults {
    fn new(input: InputSource) -> Self {
        Self {
            input,
            detections: Vec::new(),
            video_results: Vec::new(),
            failed_frames: Vec::new(),
            source_errors: Vec::new(),
            dropped_frames: 0,
        }
    }

    pub fn total_detections(&self) -> usize {
        self.detections.len()
    }

    /// Successfully processed frames
    pub fn frames(&self) -> usize {
        self.video_results.len()
    }

    /// Draw the detections of the `index`th successful frame.
    pub fn render_frame(&self, index: usize, options: &DetectionOptions) -> Option<std::result::Result<RgbImage, VisionError>> {
        self.video_results
            .get(index)
            .map(|r| draw_detections(&r.image, &r.detections, options))
    }
}

/// Object detector.
///
/// `detect_frame` and `detect_batch` run on the caller's thread; `detect`
/// drives a [`FrameSource`] through the concurrent [`Pipeline`]. Create it
/// inside a tokio runtime.
pub struct Detector {
    engine: SharedEngine,
    processor: FrameProcessor,
    pipeline: Pipeline,
    /// One `detect` run at a time, so runs never take each other's results
    run_lock: tokio::sync::Mutex<()>,
}

impl Detector {
    pub fn new(engine: SharedEngine, config: DetectorConfig, options: DetectionOptions) -> PipelineResult<Self> {
        Self::with_pipeline(engine, config, options, PipelineConfig::default())
    }

    pub fn with_pipeline(
        engine: SharedEngine,
        config: DetectorConfig,
        options: DetectionOptions,
        pipeline_config: PipelineConfig,
    ) -> PipelineResult<Self> {
        let processor = FrameProcessor::new(&config, engine.clone(), options)?;
        let pipeline = Pipeline::new(processor.clone(), pipeline_config)?;
        info!("Detector ready with engine {}", engine.name());

        Ok(Self {
            engine,
            processor,
            pipeline,
            run_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn options(&self) -> DetectionOptions {
        self.processor.options()
    }

    /// Replace thresholds and drawing options for subsequent frames.
    pub fn set_runtime_options(&self, options: DetectionOptions) -> PipelineResult<()> {
        self.processor.set_options(options)?;
        Ok(())
    }

    pub fn detect_frame(&self, frame: &Frame) -> Result<Vec<Detection>> {
        self.processor.detect(frame)
    }

    /// One engine call for every frame; a failure fails them all.
    pub fn detect_batch(&self, frames: &[Frame]) -> Result<Vec<Vec<Detection>>> {
        self.processor.detect_batch(frames)
    }

    /// Run every frame of `source` through the pipeline.
    ///
    /// `options` applies to this run only. Results and callbacks come in
    /// submission order. Per-frame failures are collected, not returned.
    pub async fn detect(
        &self,
        source: &mut dyn FrameSource,
        options: Option<DetectionOptions>,
        mut callback: Option<DetectionCallback>,
    ) -> Result<DetectionResults> {
        let _run = self.run_lock.lock().await;

        let previous = match options {
            Some(options) => {
                let previous = self.processor.options();
                self.processor.set_options(options)?;
                Some(previous)
            }
            None => None,
        };

        let outcome = self.run(source, &mut callback).await;

        if let Some(previous) = previous {
            self.processor.set_options(previous)?;
        }
        outcome
    }

    async fn run(
        &self,
        source: &mut dyn FrameSource,
        callback: &mut Option<DetectionCallback>,
    ) -> Result<DetectionResults> {
        let input = source.input().clone();
        info!("Detection started on {} source", input.kind());

        let mut sequencer = Sequencer::new(DetectionResults::new(input));
        let dropped_before = self.pipeline.performance().dropped_results;
        // ids dropped before this run can never match one of ours
        self.pipeline.take_dropped_ids();

        loop {
            // keep draining results while the source is idle
            let next = source.next_frame();
            tokio::pin!(next);
            let frame = loop {
                sequencer.skip_dropped(self.pipeline.take_dropped_ids(), callback);
                let waiting = sequencer.outstanding() > 0;
                tokio::select! {
                    biased;
                    result = self.pipeline.next_result(), if waiting => match result {
                        Some(result) => sequencer.accept(result, callback),
                        None => return Err(Error::ShutDown),
                    },
                    frame = &mut next => break frame,
                    _ = tokio::time::sleep(RESULT_POLL_INTERVAL), if waiting => {}
                }
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("Frame source error: {}", e);
                    sequencer.results.source_errors.push(e);
                    continue;
                }
                None => break,
            };

            match self.pipeline.submit(frame).await? {
                Submission::Queued { id } => sequencer.expect(id),
                Submission::Inline(result) => {
                    sequencer.expect(result.id);
                    sequencer.accept(result, callback);
                }
            }
        }

        // wait for stragglers, giving up on those backpressure discarded
        loop {
            sequencer.skip_dropped(self.pipeline.take_dropped_ids(), callback);
            let lost = self.pipeline.performance().dropped_results.saturating_sub(dropped_before);
            // drops beyond the id history are only visible in the counter
            if sequencer.outstanding() as u64 <= lost.saturating_sub(sequencer.skipped) {
                break;
            }
            match tokio::time::timeout(RESULT_POLL_INTERVAL, self.pipeline.next_result()).await {
                Ok(Some(result)) => sequencer.accept(result, callback),
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        let lost = self.pipeline.performance().dropped_results.saturating_sub(dropped_before);
        let mut results = sequencer.finish(callback);
        results.dropped_frames = lost;
        info!(
            "Detection finished: {} frames, {} detections, {} failed, {} dropped",
            results.frames(),
            results.total_detections(),
            results.failed_frames.len(),
            results.dropped_frames
        );
        Ok(results)
    }

    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;
    }
}

/// Emits results in submission order as they become contiguous.
struct Sequencer {
    order: VecDeque<u64>,
    /// Submitted, neither received nor known dropped
    waiting: HashSet<u64>,
    ready: HashMap<u64, FrameResult>,
    dropped: HashSet<u64>,
    skipped: u64,
    results: DetectionResults,
}

impl Sequencer {
    fn new(results: DetectionResults) -> Self {
        Self {
            order: VecDeque::new(),
            waiting: HashSet::new(),
            ready: HashMap::new(),
            dropped: HashSet::new(),
            skipped: 0,
            results,
        }
    }

    fn expect(&mut self, id: u64) {
        self.order.push_back(id);
        self.waiting.insert(id);
    }

    /// Submitted but not yet received
    fn outstanding(&self) -> usize {
        self.waiting.len()
    }

    fn accept(&mut self, result: FrameResult, callback: &mut Option<DetectionCallback>) {
        if !self.waiting.remove(&result.id) {
            debug!("ignoring result for task {} submitted outside this run", result.id);
            return;
        }
        self.ready.insert(result.id, result);
        self.advance(callback);
    }

    /// Stop waiting for results the backpressure policy discarded.
    fn skip_dropped(&mut self, ids: Vec<u64>, callback: &mut Option<DetectionCallback>) {
        let mut any = false;
        for id in ids {
            if self.waiting.remove(&id) {
                self.dropped.insert(id);
                self.skipped += 1;
                any = true;
            }
        }
        if any {
            self.advance(callback);
        }
    }

    fn advance(&mut self, callback: &mut Option<DetectionCallback>) {
        while let Some(&id) = self.order.front() {
            if let Some(result) = self.ready.remove(&id) {
                self.order.pop_front();
                self.emit(result, callback);
            } else if self.dropped.remove(&id) {
                self.order.pop_front();
                debug!("skipping dropped result for task {}", id);
            } else {
                break;
            }
        }
    }

    /// Emit what arrived, skipping the gaps left by dropped results.
    fn finish(mut self, callback: &mut Option<DetectionCallback>) -> DetectionResults {
        while let Some(id) = self.order.pop_front() {
            match self.ready.remove(&id) {
                Some(result) => self.emit(result, callback),
                None => debug!("no result for task {}", id),
            }
        }
        self.results
    }

    fn emit(&mut self, result: FrameResult, callback: &mut Option<DetectionCallback>) {
        let frame_number = result.frame_number();
        match result.outcome {
            Ok(detections) => {
                let video = VideoFrameResult {
                    frame_number,
                    timestamp: result.frame.timestamp(),
                    detections,
                    image: result.frame,
                };
                if let Some(callback) = callback.as_mut() {
                    callback.invoke(&video);
                }
                self.results.detections.extend(video.detections.iter().cloned());
                self.results.video_results.push(video);
            }
            Err(e) => {
                debug!("frame {} failed: {}", frame_number, e);
                self.results.failed_frames.push((frame_number, e));
            }
        }
    }
}
