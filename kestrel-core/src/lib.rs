//! kestrel-core: shared types for the kestrel detection pipeline
//!
//! Frames, detections, tensors, input descriptors and the error taxonomy
//! used by every other kestrel crate.

pub mod detection;
pub mod error;
pub mod frame;
pub mod input;
pub mod tensor;

pub use detection::{BoundingBox, Detection};
pub use error::{Error, RejectReason, Result};
pub use frame::{Frame, PixelFormat};
pub use input::InputSource;
pub use tensor::Tensor;
