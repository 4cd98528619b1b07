//! Model-space to source-space box mapping

use crate::codec::ResizeGeometry;
use crate::config::ResizeMode;
use kestrel_core::{Detection, Result};

/// Inverts the resize applied by preprocessing.
///
/// Boxes are not clamped to the frame here; a box partly inside the
/// letterbox padding maps to coordinates outside the source frame.
/// Clamp at render time if needed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
    geometry: ResizeGeometry,
}

impl CoordinateMapper {
    pub fn new(geometry: ResizeGeometry) -> Self {
        Self { geometry }
    }

    /// Build the mapper from sizes, recomputing the geometry exactly as
    /// preprocessing does.
    pub fn for_sizes(
        model_width: u32,
        model_height: u32,
        src_width: u32,
        src_height: u32,
        letterboxed: bool,
    ) -> Result<Self> {
        let mode = if letterboxed { ResizeMode::Letterbox } else { ResizeMode::Stretch };
        let geometry = ResizeGeometry::compute(src_width, src_height, model_width, model_height, mode)?;
        Ok(Self { geometry })
    }

    pub fn geometry(&self) -> &ResizeGeometry {
        &self.geometry
    }

    pub fn map(&self, detection: &mut Detection) {
        detection.bbox = self.geometry.to_source(&detection.bbox);
    }

    pub fn map_all(&self, mut detections: Vec<Detection>) -> Vec<Detection> {
        for det in detections.iter_mut() {
            self.map(det);
        }
        detections
    }
}

/// Rescale model-space detections back to source-frame pixels.
pub fn to_source_space(
    detections: Vec<Detection>,
    model_width: u32,
    model_height: u32,
    src_width: u32,
    src_height: u32,
    letterboxed: bool,
) -> Result<Vec<Detection>> {
    let mapper = CoordinateMapper::for_sizes(model_width, model_height, src_width, src_height, letterboxed)?;
    Ok(mapper.map_all(detections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::BoundingBox;

    fn det(bbox: BoundingBox) -> Detection {
        Detection::new(bbox, 0.9, 3, "car")
    }

    #[test]
    fn test_letterbox_inverse() {
        let mapped = to_source_space(
            vec![det(BoundingBox::new(100.0, 100.0, 200.0, 200.0))],
            640,
            640,
            1280,
            720,
            true,
        )
        .unwrap();
        assert_eq!(mapped[0].bbox, BoundingBox::new(200.0, -80.0, 400.0, 120.0));
    }

    #[test]
    fn test_stretch_scales_axes_independently() {
        let mapped = to_source_space(
            vec![det(BoundingBox::new(64.0, 64.0, 320.0, 320.0))],
            640,
            640,
            1280,
            320,
            false,
        )
        .unwrap();
        assert_eq!(mapped[0].bbox, BoundingBox::new(128.0, 32.0, 640.0, 160.0));
    }

    #[test]
    fn test_content_box_maps_to_full_frame() {
        for (w, h) in [(1280, 720), (720, 1280), (333, 777), (640, 640)] {
            let mapper = CoordinateMapper::for_sizes(640, 640, w, h, true).unwrap();
            let b = mapper.geometry().to_source(&mapper.geometry().content_box());
            assert!(b.x1.abs() < 1.0 && b.y1.abs() < 1.0, "{}x{} -> {:?}", w, h, b);
            assert!((b.x2 - w as f32).abs() < 1.0 && (b.y2 - h as f32).abs() < 1.0, "{}x{} -> {:?}", w, h, b);
        }
    }

    #[test]
    fn test_preserves_metadata() {
        let mapper = CoordinateMapper::for_sizes(640, 640, 640, 640, true).unwrap();
        let out = mapper.map_all(vec![det(BoundingBox::new(1.0, 2.0, 3.0, 4.0))]);
        assert_eq!(out[0].class_name, "car");
        assert_eq!(out[0].bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    }
}
