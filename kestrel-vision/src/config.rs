//! Configuration for kestrel-vision

use crate::classes::COCO_CLASSES;
use serde::{Deserialize, Serialize};

/// How a frame is fitted to the model input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Keep aspect ratio, pad the remainder (centered)
    Letterbox,
    /// Scale each axis independently to the target size
    Stretch,
}

/// Preprocessing backend preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Single threaded baseline
    Scalar,
    /// Try the accelerated backend, fall back to scalar on failure
    Accelerated,
}

/// Detector-level configuration, fixed when the detector is built
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Model input width in pixels
    pub input_width: u32,
    /// Model input height in pixels
    pub input_height: u32,
    /// Letterbox or stretch
    pub resize_mode: ResizeMode,
    /// Gray level used for letterbox padding
    pub pad_value: u8,
    /// Preprocessing backend
    pub backend: BackendPreference,
    /// Worker threads for the accelerated backend (0 = all cores)
    pub backend_threads: usize,
    /// Class labels indexed by class id
    pub class_names: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: 640,
            input_height: 640,
            resize_mode: ResizeMode::Letterbox,
            pad_value: 114,
            backend: BackendPreference::Scalar,
            backend_threads: 0,
            class_names: COCO_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DetectorConfig {
    /// Square model input
    pub fn with_input_size(mut self, size: u32) -> Self {
        self.input_width = size;
        self.input_height = size;
        self
    }

    pub fn with_input_dims(mut self, width: u32, height: u32) -> Self {
        self.input_width = width;
        self.input_height = height;
        self
    }

    pub fn with_resize_mode(mut self, mode: ResizeMode) -> Self {
        self.resize_mode = mode;
        self
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_class_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.class_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.input_width == 0 || self.input_height == 0 {
            return Err("Input size must be non-zero".to_string());
        }

        if self.input_width > 4096 || self.input_height > 4096 {
            return Err("Input size too large (max 4096)".to_string());
        }

        // YOLO heads downsample by 32
        if self.input_width % 32 != 0 || self.input_height % 32 != 0 {
            return Err("Input size must be a multiple of 32".to_string());
        }

        Ok(())
    }
}

/// Per-run detection options, changeable between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    /// Minimum class score kept by the decoder
    pub conf_threshold: f32,
    /// IoU above which NMS suppresses the weaker box
    pub iou_threshold: f32,
    /// Suppress only within the same class
    pub class_aware_nms: bool,
    /// Cap on detections returned per frame
    pub max_detections: usize,
    pub draw_boxes: bool,
    pub draw_labels: bool,
    pub show_fps: bool,
    pub box_color: String,
    pub label_color: String,
    pub line_width: u32,
    pub font_size: u32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            conf_threshold: 0.4,
            iou_threshold: 0.5,
            class_aware_nms: false,
            max_detections: 300,
            draw_boxes: true,
            draw_labels: true,
            show_fps: false,
            box_color: "red".to_string(),
            label_color: "white".to_string(),
            line_width: 2,
            font_size: 12,
        }
    }
}

impl DetectionOptions {
    pub fn with_conf_threshold(mut self, threshold: f32) -> Self {
        self.conf_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    pub fn with_class_aware_nms(mut self, enabled: bool) -> Self {
        self.class_aware_nms = enabled;
        self
    }

    pub fn with_max_detections(mut self, max: usize) -> Self {
        self.max_detections = max;
        self
    }

    pub fn with_draw_boxes(mut self, draw: bool) -> Self {
        self.draw_boxes = draw;
        self
    }

    pub fn with_draw_labels(mut self, draw: bool) -> Self {
        self.draw_labels = draw;
        self
    }

    pub fn with_show_fps(mut self, show: bool) -> Self {
        self.show_fps = show;
        self
    }

    pub fn with_box_color(mut self, color: impl Into<String>) -> Self {
        self.box_color = color.into();
        self
    }

    pub fn with_label_color(mut self, color: impl Into<String>) -> Self {
        self.label_color = color.into();
        self
    }

    pub fn with_line_width(mut self, width: u32) -> Self {
        self.line_width = width;
        self
    }

    pub fn with_font_size(mut self, size: u32) -> Self {
        self.font_size = size;
        self
    }

    /// Validate options
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.conf_threshold) {
            return Err("Confidence threshold must be between 0 and 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err("IoU threshold must be between 0 and 1".to_string());
        }

        if self.max_detections == 0 {
            return Err("max_detections must be at least 1".to_string());
        }

        if self.line_width > 64 {
            return Err("Line width too large (max 64)".to_string());
        }

        Ok(())
    }
}
