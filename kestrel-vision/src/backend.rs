//! Preprocessing backends
//!
//! A backend fills the channel-planar model input from an already
//! resized RGB image. All backends must produce bit-identical output for
//! the same input; they differ only in how the work is scheduled.

use crate::codec::ResizeGeometry;
use crate::config::BackendPreference;
use crate::error::VisionError;
use image::RgbImage;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::{info, warn};

pub trait PreprocessBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write `[3, target_height, target_width]` normalized values into
    /// `out`, placing `content` at the geometry's padding offset and
    /// filling the remainder with `pad_value`.
    fn fill_planes(&self, content: &RgbImage, geometry: &ResizeGeometry, pad_value: u8, out: &mut [f32]);
}

#[inline]
fn normalize(v: u8) -> f32 {
    v as f32 / 255.0
}

/// Fill one output row of one channel plane.
#[inline]
fn fill_row(
    row: &mut [f32],
    channel: usize,
    y: u32,
    content: &RgbImage,
    geometry: &ResizeGeometry,
    pad_value: u8,
) {
    let pad = normalize(pad_value);
    let inside_y = y >= geometry.pad_y && y < geometry.pad_y + geometry.content_height;
    if !inside_y {
        row.fill(pad);
        return;
    }

    let cy = y - geometry.pad_y;
    for (x, value) in row.iter_mut().enumerate() {
        let x = x as u32;
        *value = if x >= geometry.pad_x && x < geometry.pad_x + geometry.content_width {
            normalize(content.get_pixel(x - geometry.pad_x, cy)[channel])
        } else {
            pad
        };
    }
}

/// Single threaded baseline
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarBackend;

impl PreprocessBackend for ScalarBackend {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn fill_planes(&self, content: &RgbImage, geometry: &ResizeGeometry, pad_value: u8, out: &mut [f32]) {
        let width = geometry.target_width as usize;
        let height = geometry.target_height as usize;
        for (row_idx, row) in out.chunks_mut(width).enumerate() {
            let channel = row_idx / height;
            let y = (row_idx % height) as u32;
            fill_row(row, channel, y, content, geometry, pad_value);
        }
    }
}

/// Row-parallel backend on a dedicated rayon pool
pub struct ParallelBackend {
    pool: ThreadPool,
}

impl ParallelBackend {
    /// `threads == 0` sizes the pool to the machine.
    pub fn new(threads: usize) -> Result<Self, VisionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("kestrel-preprocess-{}", i))
            .build()
            .map_err(|e| VisionError::BackendInit(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for ParallelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelBackend").field("threads", &self.threads()).finish()
    }
}

impl PreprocessBackend for ParallelBackend {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn fill_planes(&self, content: &RgbImage, geometry: &ResizeGeometry, pad_value: u8, out: &mut [f32]) {
        let width = geometry.target_width as usize;
        let height = geometry.target_height as usize;
        self.pool.install(|| {
            out.par_chunks_mut(width).enumerate().for_each(|(row_idx, row)| {
                let channel = row_idx / height;
                let y = (row_idx % height) as u32;
                fill_row(row, channel, y, content, geometry, pad_value);
            });
        });
    }
}

/// Build the backend named by `preference`.
pub fn select_backend(
    preference: BackendPreference,
    threads: usize,
) -> Result<Arc<dyn PreprocessBackend>, VisionError> {
    match preference {
        BackendPreference::Scalar => Ok(Arc::new(ScalarBackend)),
        BackendPreference::Accelerated => {
            let backend = ParallelBackend::new(threads)?;
            info!("Preprocess backend: parallel ({} threads)", backend.threads());
            Ok(Arc::new(backend))
        }
    }
}

/// Like [`select_backend`], but never fails: an accelerated backend that
/// cannot start is replaced by the scalar one.
pub fn init_backend_with_fallback(preference: BackendPreference, threads: usize) -> Arc<dyn PreprocessBackend> {
    match select_backend(preference, threads) {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Preprocess backend {:?} unavailable, using scalar: {}", preference, e);
            Arc::new(ScalarBackend)
        }
    }
}
