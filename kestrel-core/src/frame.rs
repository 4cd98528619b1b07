//! Raw frames as delivered by a frame source

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest frame accepted (8K UHD)
pub const MAX_FRAME_WIDTH: u32 = 7680;
pub const MAX_FRAME_HEIGHT: u32 = 4320;

/// Memory layout of a packed pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Bgr8,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }

    /// Read one pixel as RGB from a packed slice starting at `offset`.
    #[inline]
    pub fn rgb_at(&self, data: &[u8], offset: usize) -> [u8; 3] {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => [data[offset], data[offset + 1], data[offset + 2]],
            PixelFormat::Bgr8 => [data[offset + 2], data[offset + 1], data[offset]],
        }
    }
}

/// An immutable view of one decoded video frame.
///
/// Pixel data is reference counted, so cloning a frame to hand it to a
/// worker never copies pixels and never lets two owners mutate them.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Bytes,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_number: u64,
    timestamp: Duration,
}

impl Frame {
    /// Wrap a packed pixel buffer. Fails if the buffer does not match the
    /// declared dimensions.
    pub fn new(
        pixels: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        frame_number: u64,
        timestamp: Duration,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Preprocess("Frame dimensions cannot be zero".to_string()));
        }
        if width > MAX_FRAME_WIDTH || height > MAX_FRAME_HEIGHT {
            return Err(Error::Preprocess(format!(
                "Frame too large: {}x{} (max {}x{})",
                width, height, MAX_FRAME_WIDTH, MAX_FRAME_HEIGHT
            )));
        }

        let pixels = pixels.into();
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(format.channels()))
            .ok_or_else(|| Error::Preprocess("Frame size would overflow".to_string()))?;
        if pixels.len() != expected {
            return Err(Error::Preprocess(format!(
                "Pixel buffer holds {} bytes, expected {} for {}x{} {:?}",
                pixels.len(),
                expected,
                width,
                height,
                format
            )));
        }

        Ok(Self {
            pixels,
            width,
            height,
            format,
            frame_number,
            timestamp,
        })
    }

    /// Convenience constructor for a still image (frame 0, zero timestamp).
    pub fn still(pixels: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        Self::new(pixels, width, height, format, 0, Duration::ZERO)
    }

    /// A frame filled with a single RGB color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], frame_number: u64, timestamp: Duration) -> Result<Self> {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, PixelFormat::Rgb8, frame_number, timestamp)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// RGB value of the pixel at (x, y).
    #[inline]
    pub fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = (y as usize * self.width as usize + x as usize) * self.format.channels();
        self.format.rgb_at(&self.pixels, offset)
    }

    /// Packed RGB copy of the frame, converting from the source format.
    pub fn to_rgb_vec(&self) -> Vec<u8> {
        if self.format == PixelFormat::Rgb8 {
            return self.pixels.to_vec();
        }
        let channels = self.format.channels();
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for px in self.pixels.chunks_exact(channels) {
            out.extend_from_slice(&self.format.rgb_at(px, 0));
        }
        out
    }

    /// Same pixels, new sequence position.
    pub fn with_sequence(mut self, frame_number: u64, timestamp: Duration) -> Self {
        self.frame_number = frame_number;
        self.timestamp = timestamp;
        self
    }
}
