//! kestrel-vision: frame codec and detection post-processing
//!
//! Turns raw frames into model input tensors, decodes raw YOLO-style
//! outputs into detections, suppresses overlaps and maps boxes back to
//! source-frame pixels. The inference engine itself sits behind the
//! [`InferenceEngine`] trait; an ONNX Runtime engine is available with
//! the `onnx` feature.

pub mod backend;
pub mod classes;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod mapper;
pub mod nms;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod processor;
pub mod render;

pub use backend::{init_backend_with_fallback, select_backend, ParallelBackend, PreprocessBackend, ScalarBackend};
pub use classes::COCO_CLASSES;
pub use codec::{decode_output, Preprocessed, ResizeGeometry, TensorCodec};
pub use config::{BackendPreference, DetectionOptions, DetectorConfig, ResizeMode};
pub use engine::{FixedOutputEngine, InferenceEngine, SharedEngine};
pub use error::VisionError;
pub use mapper::{to_source_space, CoordinateMapper};
pub use nms::Suppressor;
#[cfg(feature = "onnx")]
pub use onnx::{Accelerator, OnnxEngine};
pub use processor::FrameProcessor;
pub use render::{draw_detections, label_anchor, parse_color};
