//! Inference engine seam
//!
//! The engine is an external collaborator: it receives a normalized
//! `[1, 3, H, W]` tensor and returns the raw `[1, 4 + classes, boxes]`
//! output. Engines are owned through an explicit handle
//! ([`SharedEngine`]) that callers pass into the processor and pipeline.

use kestrel_core::{Error, Result, Tensor};
use std::sync::Arc;

pub trait InferenceEngine: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Run one input through the model. Blocking.
    fn infer(&self, input: &Tensor) -> Result<Tensor>;

    /// Run several inputs in one call. Any failure fails the whole batch.
    ///
    /// The default runs inputs one at a time; engines with native
    /// batching should override it.
    fn infer_batch(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        inputs.iter().map(|input| self.infer(input)).collect()
    }
}

/// Shared engine handle. Dropping the last clone tears the engine down.
pub type SharedEngine = Arc<dyn InferenceEngine>;

/// Engine that returns the same output for every input.
///
/// Useful for demos and for exercising the pipeline without a model.
#[derive(Debug, Clone)]
pub struct FixedOutputEngine {
    output: Tensor,
}

impl FixedOutputEngine {
    pub fn new(output: Tensor) -> Result<Self> {
        let shape = output.shape();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(Error::UnsupportedOutputShape { shape: shape.to_vec() });
        }
        Ok(Self { output })
    }

    /// Output with a single box of `class_id` scoring `score` at the given
    /// model-space corners, every other box empty.
    pub fn single_box(
        num_classes: usize,
        num_boxes: usize,
        corners: (f32, f32, f32, f32),
        class_id: usize,
        score: f32,
    ) -> Result<Self> {
        if num_boxes == 0 || class_id >= num_classes {
            return Err(Error::Configuration(format!(
                "class {} out of range for {} classes / {} boxes",
                class_id, num_classes, num_boxes
            )));
        }

        let features = 4 + num_classes;
        let mut data = vec![0.0f32; features * num_boxes];
        let (x1, y1, x2, y2) = corners;
        data[0] = (x1 + x2) / 2.0;
        data[num_boxes] = (y1 + y2) / 2.0;
        data[2 * num_boxes] = x2 - x1;
        data[3 * num_boxes] = y2 - y1;
        data[(4 + class_id) * num_boxes] = score;

        Self::new(Tensor::new(data, vec![1, features, num_boxes])?)
    }
}

impl InferenceEngine for FixedOutputEngine {
    fn name(&self) -> &str {
        "fixed-output"
    }

    fn infer(&self, input: &Tensor) -> Result<Tensor> {
        if input.is_empty() {
            return Err(Error::Inference("empty input tensor".to_string()));
        }
        Ok(self.output.clone())
    }
}
