//! Non-maximum suppression

use kestrel_core::Detection;
use tracing::trace;

/// Greedy NMS over candidate detections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suppressor {
    iou_threshold: f32,
    class_aware: bool,
    max_detections: usize,
}

impl Default for Suppressor {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Suppressor {
    /// Class-agnostic suppressor with no output cap
    pub fn new(iou_threshold: f32) -> Self {
        Self {
            iou_threshold,
            class_aware: false,
            max_detections: usize::MAX,
        }
    }

    /// Only suppress boxes of the same class
    pub fn class_aware(mut self, enabled: bool) -> Self {
        self.class_aware = enabled;
        self
    }

    pub fn max_detections(mut self, max: usize) -> Self {
        self.max_detections = max;
        self
    }

    pub fn iou_threshold(&self) -> f32 {
        self.iou_threshold
    }

    /// Keep a detection if its IoU with every already kept detection is
    /// at most the threshold. Survivors come back in descending score
    /// order; equal scores keep their input order.
    pub fn suppress(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        let candidates = detections.len();
        detections.retain(|d| d.score.is_finite());
        // sort_by is stable
        detections.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut kept: Vec<Detection> = Vec::with_capacity(detections.len().min(self.max_detections));
        for det in detections {
            if kept.len() >= self.max_detections {
                break;
            }

            let overlaps = kept.iter().any(|k| {
                (!self.class_aware || k.class_id == det.class_id) && k.bbox.iou(&det.bbox) > self.iou_threshold
            });
            if !overlaps {
                kept.push(det);
            }
        }

        trace!("nms kept {} of {} candidates", kept.len(), candidates);
        kept
    }
}
