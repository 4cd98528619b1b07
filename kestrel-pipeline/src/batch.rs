//! Groups pending frames into a single inference call

use kestrel_core::{Detection, Error, Frame, Result};
use kestrel_vision::FrameProcessor;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct BatchItem {
    frame: Frame,
    reply: oneshot::Sender<Result<Vec<Detection>>>,
}

/// Collects frames until `max_batch_size` are waiting or the flush
/// timeout passes since the first one, then runs them through the engine
/// in one call. A failed call fails every frame in the batch.
pub struct BatchAssembler {
    tx: mpsc::Sender<BatchItem>,
    collector: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    max_batch_size: usize,
}

impl BatchAssembler {
    /// Must be called within a tokio runtime.
    pub fn new(processor: FrameProcessor, max_batch_size: usize, flush_timeout: Duration) -> Self {
        let max_batch_size = max_batch_size.max(1);
        let (tx, rx) = mpsc::channel(max_batch_size * 2);
        let cancel = CancellationToken::new();
        let collector = tokio::spawn(collect(processor, rx, max_batch_size, flush_timeout, cancel.clone()));

        Self {
            tx,
            collector: Mutex::new(Some(collector)),
            cancel,
            max_batch_size,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Detect one frame as part of the next batch.
    pub async fn detect(&self, frame: Frame) -> Result<Vec<Detection>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BatchItem { frame, reply })
            .await
            .map_err(|_| Error::ShutDown)?;
        response.await.map_err(|_| Error::ShutDown)?
    }

    /// Flush what is pending and stop the collector.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.collector.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Batch collector ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for BatchAssembler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn collect(
    processor: FrameProcessor,
    mut rx: mpsc::Receiver<BatchItem>,
    max_batch_size: usize,
    flush_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let mut batch = vec![first];
        let deadline = Instant::now() + flush_timeout;
        while batch.len() < max_batch_size {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        flush(&processor, batch).await;
    }

    // frames that arrived after cancellation still get an answer
    rx.close();
    let mut rest = Vec::new();
    while let Ok(item) = rx.try_recv() {
        rest.push(item);
    }
    while !rest.is_empty() {
        let take = rest.len().min(max_batch_size);
        let chunk: Vec<BatchItem> = rest.drain(..take).collect();
        flush(&processor, chunk).await;
    }
    debug!("batch collector stopped");
}

async fn flush(processor: &FrameProcessor, batch: Vec<BatchItem>) {
    if batch.is_empty() {
        return;
    }

    let (frames, replies): (Vec<Frame>, Vec<oneshot::Sender<Result<Vec<Detection>>>>) =
        batch.into_iter().map(|item| (item.frame, item.reply)).unzip();
    debug!("flushing batch of {}", frames.len());

    let processor = processor.clone();
    let outcome = match tokio::task::spawn_blocking(move || processor.detect_batch(&frames)).await {
        Ok(outcome) => outcome,
        Err(e) => Err(Error::Inference(format!("batch inference task failed: {}", e))),
    };

    match outcome {
        Ok(per_frame) => {
            for (reply, detections) in replies.into_iter().zip(per_frame) {
                let _ = reply.send(Ok(detections));
            }
        }
        Err(e) => {
            warn!("Batch of {} failed: {}", replies.len(), e);
            for reply in replies {
                let _ = reply.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Tensor;
    use kestrel_vision::{DetectionOptions, DetectorConfig, FixedOutputEngine, InferenceEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records batch sizes, optionally failing every call
    struct CountingEngine {
        inner: FixedOutputEngine,
        batches: parking_lot::Mutex<Vec<usize>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl InferenceEngine for CountingEngine {
        fn name(&self) -> &str {
            "counting"
        }

        fn infer(&self, input: &Tensor) -> Result<Tensor> {
            self.inner.infer(input)
        }

        fn infer_batch(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(inputs.len());
            if self.fail {
                return Err(Error::Inference("device lost".to_string()));
            }
            inputs.iter().map(|i| self.inner.infer(i)).collect()
        }
    }

    fn engine(fail: bool) -> Arc<CountingEngine> {
        Arc::new(CountingEngine {
            inner: FixedOutputEngine::single_box(2, 4, (0.0, 0.0, 32.0, 32.0), 1, 0.9).unwrap(),
            batches: parking_lot::Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn processor(engine: Arc<CountingEngine>) -> FrameProcessor {
        let config = DetectorConfig::default()
            .with_input_size(32)
            .with_class_names(["a", "b"]);
        FrameProcessor::new(&config, engine, DetectionOptions::default()).unwrap()
    }

    fn frame(n: u64) -> Frame {
        Frame::solid(32, 32, [0, 0, 0], n, Duration::ZERO).unwrap()
    }

    #[tokio::test]
    async fn test_full_batch_is_one_call() {
        let engine = engine(false);
        let assembler = Arc::new(BatchAssembler::new(processor(engine.clone()), 4, Duration::from_secs(30)));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let assembler = assembler.clone();
                tokio::spawn(async move { assembler.detect(frame(n)).await })
            })
            .collect();
        for handle in handles {
            let dets = handle.await.unwrap().unwrap();
            assert_eq!(dets.len(), 1);
            assert_eq!(dets[0].class_name, "b");
        }

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*engine.batches.lock(), vec![4]);
        assembler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_timeout() {
        let engine = engine(false);
        let assembler = BatchAssembler::new(processor(engine.clone()), 8, Duration::from_millis(20));

        let dets = assembler.detect(frame(0)).await.unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(*engine.batches.lock(), vec![1]);
        assembler.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_failure_is_uniform() {
        let engine = engine(true);
        let assembler = Arc::new(BatchAssembler::new(processor(engine.clone()), 3, Duration::from_secs(30)));

        let handles: Vec<_> = (0..3)
            .map(|n| {
                let assembler = assembler.clone();
                tokio::spawn(async move { assembler.detect(frame(n)).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap_err(),
                Error::Inference("device lost".to_string())
            );
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detect_after_shutdown() {
        let assembler = BatchAssembler::new(processor(engine(false)), 2, Duration::from_millis(5));
        assembler.shutdown().await;
        assert_eq!(assembler.detect(frame(0)).await.unwrap_err(), Error::ShutDown);
    }
}
