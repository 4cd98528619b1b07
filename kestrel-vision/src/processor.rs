//! Per-frame detection: preprocess, infer, decode, suppress, map back

use crate::backend::init_backend_with_fallback;
use crate::codec::{Preprocessed, ResizeGeometry, TensorCodec};
use crate::config::{DetectionOptions, DetectorConfig};
use crate::engine::SharedEngine;
use crate::error::VisionError;
use crate::mapper::CoordinateMapper;
use crate::nms::Suppressor;
use kestrel_core::{Detection, Error, Frame, Result, Tensor};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the full detection chain for single frames or batches.
///
/// Cheap to clone; clones share the engine handle and runtime options.
#[derive(Clone)]
pub struct FrameProcessor {
    codec: TensorCodec,
    engine: SharedEngine,
    options: Arc<RwLock<DetectionOptions>>,
}

impl FrameProcessor {
    pub fn new(
        config: &DetectorConfig,
        engine: SharedEngine,
        options: DetectionOptions,
    ) -> std::result::Result<Self, VisionError> {
        config.validate().map_err(VisionError::Config)?;
        options.validate().map_err(VisionError::Config)?;

        let backend = init_backend_with_fallback(config.backend, config.backend_threads);
        let codec = TensorCodec::with_backend(config, backend);

        info!(
            "Frame processor ready: engine={}, input={}x{}, backend={}",
            engine.name(),
            config.input_width,
            config.input_height,
            codec.backend_name()
        );

        Ok(Self {
            codec,
            engine,
            options: Arc::new(RwLock::new(options)),
        })
    }

    pub fn codec(&self) -> &TensorCodec {
        &self.codec
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn options(&self) -> DetectionOptions {
        self.options.read().clone()
    }

    /// Replace the runtime options. Invalid options are rejected and the
    /// current ones kept.
    pub fn set_options(&self, options: DetectionOptions) -> std::result::Result<(), VisionError> {
        options.validate().map_err(VisionError::Config)?;
        *self.options.write() = options;
        Ok(())
    }

    pub fn preprocess(&self, frame: &Frame) -> Result<Preprocessed> {
        self.codec.preprocess(frame)
    }

    /// Decode a raw engine output, suppress overlaps in model space and
    /// map survivors to source-frame pixels.
    pub fn postprocess(&self, output: &Tensor, geometry: &ResizeGeometry) -> Result<Vec<Detection>> {
        let options = self.options();
        let raw = self.codec.decode(output, options.conf_threshold)?;
        let candidates = raw.len();

        let kept = Suppressor::new(options.iou_threshold)
            .class_aware(options.class_aware_nms)
            .max_detections(options.max_detections)
            .suppress(raw);

        debug!("{} candidates, {} after nms", candidates, kept.len());
        Ok(CoordinateMapper::new(*geometry).map_all(kept))
    }

    /// Detect at the configured model input size.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let (w, h) = self.codec.input_size();
        self.detect_at(frame, w, h)
    }

    /// Detect with an explicit model input size.
    pub fn detect_at(&self, frame: &Frame, target_width: u32, target_height: u32) -> Result<Vec<Detection>> {
        let prepared = self.codec.preprocess_to(frame, target_width, target_height)?;
        let output = self.engine.infer(&prepared.tensor)?;
        self.postprocess(&output, &prepared.geometry)
    }

    /// Detect several frames with a single engine call. A failure
    /// anywhere fails every frame.
    pub fn detect_batch(&self, frames: &[Frame]) -> Result<Vec<Vec<Detection>>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = frames
            .iter()
            .map(|frame| self.codec.preprocess(frame))
            .collect::<Result<Vec<_>>>()?;
        let (inputs, geometries): (Vec<Tensor>, Vec<ResizeGeometry>) =
            prepared.into_iter().map(|p| (p.tensor, p.geometry)).unzip();

        let outputs = self.engine.infer_batch(&inputs)?;
        if outputs.len() != inputs.len() {
            return Err(Error::Inference(format!(
                "Engine returned {} outputs for {} inputs",
                outputs.len(),
                inputs.len()
            )));
        }

        outputs
            .iter()
            .zip(geometries.iter())
            .map(|(output, geometry)| self.postprocess(output, geometry))
            .collect()
    }
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("codec", &self.codec)
            .field("engine", &self.engine.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FixedOutputEngine, InferenceEngine};
    use kestrel_core::BoundingBox;
    use std::time::Duration;

    struct ShortBatchEngine;

    impl InferenceEngine for ShortBatchEngine {
        fn name(&self) -> &str {
            "short-batch"
        }

        fn infer(&self, _input: &Tensor) -> Result<Tensor> {
            Err(Error::Inference("unused".to_string()))
        }

        fn infer_batch(&self, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(Vec::new())
        }
    }

    fn processor(engine: SharedEngine) -> FrameProcessor {
        FrameProcessor::new(&DetectorConfig::default(), engine, DetectionOptions::default()).unwrap()
    }

    #[test]
    fn test_detect_maps_to_source_space() {
        let engine = FixedOutputEngine::single_box(80, 8400, (100.0, 100.0, 200.0, 200.0), 3, 0.9).unwrap();
        let processor = processor(Arc::new(engine));
        let frame = Frame::solid(1280, 720, [10, 20, 30], 1, Duration::from_millis(33)).unwrap();

        let dets = processor.detect(&frame).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 3);
        assert_eq!(dets[0].class_name, "motorcycle");
        assert_eq!(dets[0].bbox, BoundingBox::new(200.0, -80.0, 400.0, 120.0));
    }

    #[test]
    fn test_runtime_options_apply() {
        let engine = FixedOutputEngine::single_box(80, 16, (0.0, 0.0, 64.0, 64.0), 0, 0.45).unwrap();
        let processor = processor(Arc::new(engine));
        let frame = Frame::solid(640, 640, [0, 0, 0], 0, Duration::ZERO).unwrap();
        assert_eq!(processor.detect(&frame).unwrap().len(), 1);

        processor
            .set_options(DetectionOptions::default().with_conf_threshold(0.5))
            .unwrap();
        assert!(processor.detect(&frame).unwrap().is_empty());

        assert!(processor
            .set_options(DetectionOptions::default().with_conf_threshold(2.0))
            .is_err());
        assert_eq!(processor.options().conf_threshold, 0.5);
    }

    #[test]
    fn test_detect_batch() {
        let engine = FixedOutputEngine::single_box(80, 16, (0.0, 0.0, 64.0, 64.0), 1, 0.8).unwrap();
        let processor = processor(Arc::new(engine));
        let frames = vec![
            Frame::solid(640, 640, [0, 0, 0], 0, Duration::ZERO).unwrap(),
            Frame::solid(320, 320, [0, 0, 0], 1, Duration::ZERO).unwrap(),
        ];
        let results = processor.detect_batch(&frames).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0][0].bbox, BoundingBox::new(0.0, 0.0, 64.0, 64.0));
        assert_eq!(results[1][0].bbox, BoundingBox::new(0.0, 0.0, 32.0, 32.0));
        assert!(processor.detect_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_detect_batch_output_mismatch() {
        let processor = processor(Arc::new(ShortBatchEngine));
        let frames = vec![Frame::solid(32, 32, [0, 0, 0], 0, Duration::ZERO).unwrap()];
        assert!(matches!(processor.detect_batch(&frames), Err(Error::Inference(_))));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let engine = FixedOutputEngine::single_box(1, 1, (0.0, 0.0, 1.0, 1.0), 0, 0.5).unwrap();
        let result = FrameProcessor::new(
            &DetectorConfig::default().with_input_size(100),
            Arc::new(engine),
            DetectionOptions::default(),
        );
        assert!(matches!(result, Err(VisionError::Config(_))));
    }
}
