//! Frame-to-tensor preprocessing and raw output decoding

use crate::backend::{PreprocessBackend, ScalarBackend};
use crate::classes::class_name;
use crate::config::{DetectorConfig, ResizeMode};
use image::imageops::{self, FilterType};
use image::RgbImage;
use kestrel_core::{BoundingBox, Detection, Error, Frame, Result, Tensor};
use std::sync::Arc;
use tracing::{debug, trace};

/// Largest input tensor accepted (elements)
const MAX_INPUT_ELEMENTS: usize = 100_000_000;

/// Number of leading box channels in a YOLO head (cx, cy, w, h)
pub const BOX_CHANNELS: usize = 4;

/// Placement of a source frame inside the model input.
///
/// Computed once per (source size, model size, mode) and used both to
/// build the input tensor and to map boxes back, so the two stay exact
/// inverses of each other.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeGeometry {
    pub mode: ResizeMode,
    pub src_width: u32,
    pub src_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    /// Model pixels per source pixel, horizontally
    pub scale_x: f32,
    /// Model pixels per source pixel, vertically
    pub scale_y: f32,
    /// Size of the resized image inside the target
    pub content_width: u32,
    pub content_height: u32,
    /// Left/top padding in model pixels
    pub pad_x: u32,
    pub pad_y: u32,
}

impl ResizeGeometry {
    pub fn compute(
        src_width: u32,
        src_height: u32,
        target_width: u32,
        target_height: u32,
        mode: ResizeMode,
    ) -> Result<Self> {
        if src_width == 0 || src_height == 0 {
            return Err(Error::Preprocess("Source dimensions cannot be zero".to_string()));
        }
        if target_width == 0 || target_height == 0 {
            return Err(Error::Preprocess("Target dimensions cannot be zero".to_string()));
        }

        let geometry = match mode {
            ResizeMode::Stretch => Self {
                mode,
                src_width,
                src_height,
                target_width,
                target_height,
                scale_x: target_width as f32 / src_width as f32,
                scale_y: target_height as f32 / src_height as f32,
                content_width: target_width,
                content_height: target_height,
                pad_x: 0,
                pad_y: 0,
            },
            ResizeMode::Letterbox => {
                let scale = (target_width as f32 / src_width as f32)
                    .min(target_height as f32 / src_height as f32);
                let content_width = ((src_width as f32 * scale).round() as u32).clamp(1, target_width);
                let content_height = ((src_height as f32 * scale).round() as u32).clamp(1, target_height);
                Self {
                    mode,
                    src_width,
                    src_height,
                    target_width,
                    target_height,
                    scale_x: scale,
                    scale_y: scale,
                    content_width,
                    content_height,
                    pad_x: (target_width - content_width) / 2,
                    pad_y: (target_height - content_height) / 2,
                }
            }
        };

        Ok(geometry)
    }

    /// Map a model-space box to source-frame pixels.
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        let px = self.pad_x as f32;
        let py = self.pad_y as f32;
        BoundingBox::new(
            (bbox.x1 - px) / self.scale_x,
            (bbox.y1 - py) / self.scale_y,
            (bbox.x2 - px) / self.scale_x,
            (bbox.y2 - py) / self.scale_y,
        )
    }

    /// Map a source-frame box into model space.
    pub fn to_model(&self, bbox: &BoundingBox) -> BoundingBox {
        let px = self.pad_x as f32;
        let py = self.pad_y as f32;
        BoundingBox::new(
            bbox.x1 * self.scale_x + px,
            bbox.y1 * self.scale_y + py,
            bbox.x2 * self.scale_x + px,
            bbox.y2 * self.scale_y + py,
        )
    }

    /// Model-space box covering the resized frame content.
    pub fn content_box(&self) -> BoundingBox {
        BoundingBox::new(
            self.pad_x as f32,
            self.pad_y as f32,
            (self.pad_x + self.content_width) as f32,
            (self.pad_y + self.content_height) as f32,
        )
    }
}

/// Output of [`TensorCodec::preprocess`]
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// `[1, 3, H, W]`, channel-planar RGB in `[0, 1]`
    pub tensor: Tensor,
    pub geometry: ResizeGeometry,
}

/// Converts frames to model input and model output to detections.
#[derive(Clone)]
pub struct TensorCodec {
    input_width: u32,
    input_height: u32,
    resize_mode: ResizeMode,
    pad_value: u8,
    class_names: Arc<[String]>,
    backend: Arc<dyn PreprocessBackend>,
}

impl std::fmt::Debug for TensorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorCodec")
            .field("input_width", &self.input_width)
            .field("input_height", &self.input_height)
            .field("resize_mode", &self.resize_mode)
            .field("pad_value", &self.pad_value)
            .field("classes", &self.class_names.len())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl TensorCodec {
    /// Codec using the scalar preprocessing backend
    pub fn new(config: &DetectorConfig) -> Self {
        Self::with_backend(config, Arc::new(ScalarBackend))
    }

    pub fn with_backend(config: &DetectorConfig, backend: Arc<dyn PreprocessBackend>) -> Self {
        Self {
            input_width: config.input_width,
            input_height: config.input_height,
            resize_mode: config.resize_mode,
            pad_value: config.pad_value,
            class_names: config.class_names.clone().into(),
            backend,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_width, self.input_height)
    }

    pub fn resize_mode(&self) -> ResizeMode {
        self.resize_mode
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Geometry the codec would use for a frame of the given size.
    pub fn geometry_for(&self, src_width: u32, src_height: u32) -> Result<ResizeGeometry> {
        ResizeGeometry::compute(src_width, src_height, self.input_width, self.input_height, self.resize_mode)
    }

    /// Preprocess to the configured model input size.
    pub fn preprocess(&self, frame: &Frame) -> Result<Preprocessed> {
        self.preprocess_to(frame, self.input_width, self.input_height)
    }

    /// Resize (letterbox or stretch) and normalize a frame into a
    /// `[1, 3, target_height, target_width]` tensor.
    ///
    /// Output is deterministic for a given frame and target size.
    pub fn preprocess_to(&self, frame: &Frame, target_width: u32, target_height: u32) -> Result<Preprocessed> {
        let geometry = ResizeGeometry::compute(
            frame.width(),
            frame.height(),
            target_width,
            target_height,
            self.resize_mode,
        )?;

        let len = (target_width as usize)
            .checked_mul(target_height as usize)
            .and_then(|p| p.checked_mul(3))
            .ok_or_else(|| Error::Preprocess("Input tensor size would overflow".to_string()))?;
        if len > MAX_INPUT_ELEMENTS {
            return Err(Error::Preprocess("Input tensor too large (max 100M elements)".to_string()));
        }

        let content = resize_content(frame, &geometry)?;
        let mut data = vec![0.0f32; len];
        self.backend.fill_planes(&content, &geometry, self.pad_value, &mut data);

        trace!(
            frame = frame.frame_number(),
            backend = self.backend.name(),
            "preprocessed {}x{} -> {}x{}",
            frame.width(),
            frame.height(),
            target_width,
            target_height
        );

        let tensor = Tensor::new(data, vec![1, 3, target_height as usize, target_width as usize])?;
        Ok(Preprocessed { tensor, geometry })
    }

    /// Decode a raw `[1, 4 + classes, boxes]` output into model-space
    /// detections scoring at least `conf_threshold`.
    pub fn decode(&self, output: &Tensor, conf_threshold: f32) -> Result<Vec<Detection>> {
        decode_output(output.data(), output.shape(), conf_threshold, &self.class_names)
    }
}

/// Resize the frame to the geometry's content size with a fixed filter.
fn resize_content(frame: &Frame, geometry: &ResizeGeometry) -> Result<RgbImage> {
    let image = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb_vec())
        .ok_or_else(|| Error::Preprocess("Pixel buffer does not match frame size".to_string()))?;

    if geometry.content_width == frame.width() && geometry.content_height == frame.height() {
        return Ok(image);
    }

    Ok(imageops::resize(
        &image,
        geometry.content_width,
        geometry.content_height,
        FilterType::Triangle,
    ))
}

/// Decode a YOLO-style `[1, 4 + classes, boxes]` output buffer.
///
/// The class count is taken from the shape, so models with any number
/// of classes decode without changes.
pub fn decode_output(
    data: &[f32],
    shape: &[usize],
    conf_threshold: f32,
    class_names: &[String],
) -> Result<Vec<Detection>> {
    if shape.len() != 3 || shape[0] != 1 || shape[1] <= BOX_CHANNELS {
        return Err(Error::UnsupportedOutputShape { shape: shape.to_vec() });
    }

    let num_features = shape[1];
    let num_boxes = shape[2];
    let num_classes = num_features - BOX_CHANNELS;

    let expected = num_features
        .checked_mul(num_boxes)
        .ok_or_else(|| Error::UnsupportedOutputShape { shape: shape.to_vec() })?;
    if data.len() != expected {
        return Err(Error::Decode(format!(
            "Output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            expected
        )));
    }

    debug!("decoding {} boxes, {} classes", num_boxes, num_classes);

    let channel = |c: usize| &data[c * num_boxes..(c + 1) * num_boxes];
    let (cxs, cys, ws, hs) = (channel(0), channel(1), channel(2), channel(3));

    let mut detections = Vec::new();
    for i in 0..num_boxes {
        let mut best_id = 0usize;
        let mut best_score = data[BOX_CHANNELS * num_boxes + i];
        for class_idx in 1..num_classes {
            let score = data[(BOX_CHANNELS + class_idx) * num_boxes + i];
            if score > best_score {
                best_score = score;
                best_id = class_idx;
            }
        }

        if !best_score.is_finite() || best_score < conf_threshold {
            continue;
        }

        let bbox = BoundingBox::from_center(cxs[i], cys[i], ws[i], hs[i]);
        if !bbox.is_finite() {
            continue;
        }

        detections.push(Detection::new(bbox, best_score, best_id, class_name(class_names, best_id)));
    }

    Ok(detections)
}
