//! Streams synthetic frames through the detection pipeline
//!
//! Uses a fixed-output engine so it runs without a model file.

use kestrel_core::{Frame, InputSource};
use kestrel_pipeline::{
    frame_channel, BackpressurePolicy, DetectionCallback, Detector, PipelineConfig, RateLimiterConfig,
    VideoFrameResult,
};
use kestrel_vision::{DetectionOptions, DetectorConfig, FixedOutputEngine};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // One "car" box in the middle of a 640x640 model input
    let engine = Arc::new(FixedOutputEngine::single_box(80, 8400, (240.0, 240.0, 400.0, 400.0), 2, 0.9)?);

    let pipeline_config = PipelineConfig::for_parallelism(4, 8)
        .with_backpressure(BackpressurePolicy::DropOldest)
        .with_batching(true)
        .with_rate_limiter(RateLimiterConfig {
            max_tokens: 120.0,
            refill_rate: 30.0,
        });

    let detector = Detector::with_pipeline(
        engine,
        DetectorConfig::default(),
        DetectionOptions::default().with_conf_threshold(0.5),
        pipeline_config,
    )?;

    // Capture runs on its own thread, like a camera driver would
    let (sender, mut source) = frame_channel(InputSource::parse("webcam"), 16);
    let capture = std::thread::spawn(move || {
        for n in 0..60u64 {
            let shade = (n * 4 % 255) as u8;
            let frame = Frame::solid(1280, 720, [shade, 64, 128], n, Duration::from_millis(n * 33));
            if sender.blocking_send(frame).is_err() {
                break;
            }
        }
    });

    let callback = DetectionCallback::OnVideoFrameResult(Box::new(|result: &VideoFrameResult| {
        if result.frame_number % 10 == 0 {
            for det in &result.detections {
                println!(
                    "frame {:>3} @ {:>5}ms: {} {:.2} [{:.0}, {:.0}, {:.0}, {:.0}]",
                    result.frame_number,
                    result.timestamp.as_millis(),
                    det.class_name,
                    det.score,
                    det.bbox.x1,
                    det.bbox.y1,
                    det.bbox.x2,
                    det.bbox.y2
                );
            }
        }
    }));

    let results = detector.detect(&mut source, None, Some(callback)).await?;
    let _ = capture.join();

    println!(
        "\n{} frames, {} detections, {} failed, {} dropped",
        results.frames(),
        results.total_detections(),
        results.failed_frames.len(),
        results.dropped_frames
    );

    let snapshot = detector.pipeline().stability_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    detector.shutdown().await;
    Ok(())
}
