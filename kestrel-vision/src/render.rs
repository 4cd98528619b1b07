//! Detection overlay rendering
//!
//! Draws box outlines and label plates onto a copy of the frame. Text is
//! left to the caller; [`label_anchor`] gives the position a label
//! should be drawn at.

use crate::config::DetectionOptions;
use crate::error::VisionError;
use image::{Rgb, RgbImage};
use kestrel_core::{BoundingBox, Detection, Frame};

/// Parse a named color or `#rrggbb`.
pub fn parse_color(color: &str) -> Result<Rgb<u8>, VisionError> {
    let lower = color.trim().to_ascii_lowercase();
    let rgb = match lower.as_str() {
        "red" => [255, 0, 0],
        "green" => [0, 255, 0],
        "blue" => [0, 0, 255],
        "yellow" => [255, 255, 0],
        "white" => [255, 255, 255],
        "black" => [0, 0, 0],
        "cyan" => [0, 255, 255],
        "magenta" => [255, 0, 255],
        "orange" => [255, 165, 0],
        "purple" => [128, 0, 128],
        hex if hex.len() == 7 && hex.starts_with('#') => {
            let channel = |i: usize| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| VisionError::Config(format!("Invalid color: {}", color)))
            };
            [channel(1)?, channel(3)?, channel(5)?]
        }
        _ => return Err(VisionError::Config(format!("Unknown color: {}", color))),
    };
    Ok(Rgb(rgb))
}

/// Top-left corner for a label of height `font_size` attached to `bbox`.
///
/// The label sits above the box when it fits, otherwise just inside the
/// top edge.
pub fn label_anchor(bbox: &BoundingBox, font_size: u32, image_height: u32) -> (u32, u32) {
    let plate = (font_size + 4) as f32;
    let x = bbox.x1.max(0.0) as u32;
    let y = if bbox.y1 - plate >= 0.0 {
        bbox.y1 - plate
    } else {
        bbox.y1.max(0.0)
    };
    let max_y = image_height.saturating_sub(1);
    (x, (y as u32).min(max_y))
}

/// Render detections onto a copy of the frame.
pub fn draw_detections(
    frame: &Frame,
    detections: &[Detection],
    options: &DetectionOptions,
) -> Result<RgbImage, VisionError> {
    let mut image = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb_vec())
        .ok_or_else(|| VisionError::Processing("Pixel buffer does not match frame size".to_string()))?;

    if !options.draw_boxes && !options.draw_labels {
        return Ok(image);
    }

    let box_color = parse_color(&options.box_color)?;
    let label_color = parse_color(&options.label_color)?;

    for det in detections {
        if !det.bbox.is_finite() {
            continue;
        }
        let clamped = det.bbox.clamp_to(frame.width() as f32, frame.height() as f32);
        if clamped.width() < 1.0 || clamped.height() < 1.0 {
            continue;
        }

        if options.draw_boxes {
            draw_rect_outline(&mut image, &clamped, options.line_width.max(1), box_color);
        }

        if options.draw_labels {
            let text_len = det.class_name.chars().count() as u32 + 5;
            let plate_width = text_len * (options.font_size * 3 / 5).max(1);
            let (x, y) = label_anchor(&clamped, options.font_size, frame.height());
            fill_rect(&mut image, x, y, plate_width, options.font_size + 4, box_color);
            // baseline marker where text starts
            fill_rect(&mut image, x + 2, y + options.font_size + 2, plate_width.saturating_sub(4), 1, label_color);
        }
    }

    Ok(image)
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = x.saturating_add(width).min(image.width());
    let y_end = y.saturating_add(height).min(image.height());
    for py in y.min(y_end)..y_end {
        for px in x.min(x_end)..x_end {
            image.put_pixel(px, py, color);
        }
    }
}

fn draw_rect_outline(image: &mut RgbImage, bbox: &BoundingBox, line_width: u32, color: Rgb<u8>) {
    let x1 = bbox.x1 as u32;
    let y1 = bbox.y1 as u32;
    let x2 = (bbox.x2 as u32).min(image.width().saturating_sub(1));
    let y2 = (bbox.y2 as u32).min(image.height().saturating_sub(1));
    let w = x2.saturating_sub(x1) + 1;
    let h = y2.saturating_sub(y1) + 1;
    let lw = line_width.min(w).min(h);

    fill_rect(image, x1, y1, w, lw, color);
    fill_rect(image, x1, (y2 + 1).saturating_sub(lw), w, lw, color);
    fill_rect(image, x1, y1, lw, h, color);
    fill_rect(image, (x2 + 1).saturating_sub(lw), y1, lw, h, color);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("red").unwrap(), Rgb([255, 0, 0]));
        assert_eq!(parse_color("Orange").unwrap(), Rgb([255, 165, 0]));
        assert_eq!(parse_color("#10ff0A").unwrap(), Rgb([16, 255, 10]));
        assert!(parse_color("#12").is_err());
        assert!(parse_color("#zzzzzz").is_err());
        assert!(parse_color("chartreuse").is_err());
    }

    #[test]
    fn test_label_anchor() {
        let bbox = BoundingBox::new(10.0, 50.0, 100.0, 100.0);
        assert_eq!(label_anchor(&bbox, 12, 200), (10, 34));
        let top = BoundingBox::new(10.0, 5.0, 100.0, 100.0);
        assert_eq!(label_anchor(&top, 12, 200), (10, 5));
    }

    #[test]
    fn test_draw_outline_only() {
        let frame = Frame::solid(64, 64, [0, 0, 0], 0, Duration::ZERO).unwrap();
        let det = Detection::new(BoundingBox::new(10.0, 10.0, 30.0, 30.0), 0.9, 0, "person");
        let options = DetectionOptions::default().with_draw_labels(false).with_line_width(2);
        let image = draw_detections(&frame, &[det], &options).unwrap();

        assert_eq!(*image.get_pixel(10, 10), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(11, 20), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(30, 20), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(20, 20), Rgb([0, 0, 0]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_clamps_out_of_frame_boxes() {
        let frame = Frame::solid(40, 40, [0, 0, 0], 0, Duration::ZERO).unwrap();
        let dets = vec![
            Detection::new(BoundingBox::new(-20.0, -80.0, 20.0, 20.0), 0.9, 0, "a"),
            Detection::new(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0), 0.9, 0, "b"),
        ];
        let image = draw_detections(&frame, &dets, &DetectionOptions::default()).unwrap();
        assert_eq!(*image.get_pixel(0, 10), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(39, 39), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_disabled_returns_frame() {
        let frame = Frame::solid(8, 8, [1, 2, 3], 0, Duration::ZERO).unwrap();
        let det = Detection::new(BoundingBox::new(0.0, 0.0, 8.0, 8.0), 0.9, 0, "a");
        let options = DetectionOptions::default().with_draw_boxes(false).with_draw_labels(false);
        let image = draw_detections(&frame, &[det], &options).unwrap();
        assert!(image.pixels().all(|p| *p == Rgb([1, 2, 3])));
    }
}
