//! ONNX Runtime inference engine (feature `onnx`)

use crate::engine::InferenceEngine;
use crate::error::VisionError;
use kestrel_core::{Error, Result, Tensor};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, warn};

/// Execution provider to try first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Cpu,
    Cuda { device_id: i32 },
}

/// YOLO model session behind the [`InferenceEngine`] seam
pub struct OnnxEngine {
    session: Mutex<Session>,
    input_name: String,
    accelerator: Accelerator,
}

impl OnnxEngine {
    /// Load a model. A CUDA request that cannot be satisfied falls back
    /// to the CPU provider with a warning.
    pub fn new(model_path: &Path, accelerator: Accelerator) -> std::result::Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::Model(format!("Model file not found: {:?}", model_path)));
        }

        let (session, active) = match accelerator {
            Accelerator::Cuda { device_id } => match Self::cuda_session(model_path, device_id) {
                Ok(session) => (session, accelerator),
                Err(e) => {
                    warn!("CUDA execution provider unavailable, falling back to CPU: {}", e);
                    (Self::cpu_session(model_path)?, Accelerator::Cpu)
                }
            },
            Accelerator::Cpu => (Self::cpu_session(model_path)?, Accelerator::Cpu),
        };

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::Model("Model has no inputs".to_string()))?;

        info!("ONNX model loaded from {:?} ({:?})", model_path, active);

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            accelerator: active,
        })
    }

    fn cuda_session(model_path: &Path, device_id: i32) -> std::result::Result<Session, VisionError> {
        Session::builder()
            .map_err(|e| VisionError::Ort(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VisionError::Ort(e.to_string()))?
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()
                .error_on_failure()])
            .map_err(|e| VisionError::BackendInit(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::Ort(format!("Failed to load model: {}", e)))
    }

    fn cpu_session(model_path: &Path) -> std::result::Result<Session, VisionError> {
        Session::builder()
            .map_err(|e| VisionError::Ort(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VisionError::Ort(e.to_string()))?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(|e| VisionError::Ort(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| VisionError::Ort(format!("Failed to load model: {}", e)))
    }

    /// Provider actually in use
    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }
}

impl InferenceEngine for OnnxEngine {
    fn name(&self) -> &str {
        match self.accelerator {
            Accelerator::Cpu => "onnx-cpu",
            Accelerator::Cuda { .. } => "onnx-cuda",
        }
    }

    fn infer(&self, input: &Tensor) -> Result<Tensor> {
        let value = ort::value::Tensor::from_array((input.shape().to_vec(), input.data().to_vec()))
            .map_err(|e| Error::Inference(format!("Failed to build input tensor: {}", e)))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => value])
            .map_err(|e| Error::Inference(format!("Inference failed: {}", e)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("Failed to extract output: {}", e)))?;

        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        debug!("onnx output shape {:?}", shape);
        Tensor::new(data.to_vec(), shape)
    }
}

impl std::fmt::Debug for OnnxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEngine")
            .field("input_name", &self.input_name)
            .field("accelerator", &self.accelerator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_reported() {
        let err = OnnxEngine::new(Path::new("/nonexistent/model.onnx"), Accelerator::Cpu).unwrap_err();
        assert!(matches!(err, VisionError::Model(_)));
    }
}
