//! Bounded worker pool over an asynchronous task queue

use crate::batch::BatchAssembler;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
use crate::config::{validate_rate_limit, CircuitBreakerConfig, PipelineConfig, RateLimiterConfig, ResourceLimits};
use crate::delivery::ResultChannel;
use crate::error::{PipelineError, Result as PipelineResult};
use crate::health::{HealthChecker, HealthInputs, HealthReport, HealthSnapshot};
use crate::performance::{MetricsSnapshot, PerformanceMetrics};
use crate::rate_limiter::{RateLimiter, RateLimiterSnapshot};
use crate::resource_monitor::{ActiveTaskGuard, MemoryProbe, ResourceMonitor, ResourceSnapshot, SystemMemoryProbe};
use crate::task::{FrameResult, Submission, Task};
use kestrel_core::{Detection, Error, Frame, RejectReason, Result};
use kestrel_vision::FrameProcessor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue occupancy at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Tasks waiting for a worker
    pub pending: usize,
    pub capacity: usize,
    /// Results waiting for the consumer
    pub results: usize,
    pub result_capacity: usize,
    /// Free inference permits
    pub available_workers: usize,
    pub parallelism: usize,
}

/// Combined status of every resilience component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilitySnapshot {
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub resource_monitor: ResourceSnapshot,
    pub health_checker: HealthSnapshot,
    pub performance_metrics: MetricsSnapshot,
    pub queue: QueueStatus,
}

/// State shared by the submitter and every worker. Each component
/// carries its own lock.
struct Shared {
    processor: FrameProcessor,
    batcher: Option<BatchAssembler>,
    permits: Arc<Semaphore>,
    parallelism: usize,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    resources: Arc<ResourceMonitor>,
    health: HealthChecker,
    metrics: Arc<PerformanceMetrics>,
    results: ResultChannel,
    queue_capacity: usize,
    pending: AtomicUsize,
}

impl Shared {
    /// Resource ceiling, then token bucket, then circuit. The circuit goes
    /// last so a rejection never leaves a half-open trial claimed. The
    /// returned guard holds the task's active slot.
    fn admit(&self) -> std::result::Result<ActiveTaskGuard, RejectReason> {
        let slot = self.resources.try_admit()?;
        if !self.limiter.try_acquire() {
            return Err(RejectReason::RateLimited);
        }
        self.breaker.try_acquire()?;
        Ok(slot)
    }

    async fn run(&self, task: Task, inline: bool) -> FrameResult {
        let start = Instant::now();

        let _active = match self.admit() {
            Ok(slot) => slot,
            Err(reason) => {
                self.metrics.record_rejection(reason);
                debug!("task {} rejected: {}", task.id, reason);
                return FrameResult {
                    id: task.id,
                    frame: task.frame,
                    outcome: Err(Error::AdmissionRejected(reason)),
                    latency: start.elapsed(),
                    inline,
                };
            }
        };
        let outcome = self.infer(&task).await;
        let latency = start.elapsed();

        match &outcome {
            Ok(detections) => {
                self.breaker.record_success();
                self.metrics.record_success(latency);
                debug!("task {} done: {} detections in {:?}", task.id, detections.len(), latency);
            }
            Err(e) if e.counts_as_failure() => {
                self.breaker.record_failure();
                self.metrics.record_failure(latency);
                warn!("task {} (frame {}) failed: {}", task.id, task.frame.frame_number(), e);
            }
            Err(Error::ShutDown) => {
                self.breaker.abandon_trial();
                self.metrics.record_cancelled();
            }
            Err(e) => {
                self.breaker.abandon_trial();
                self.metrics.record_failure(latency);
                warn!("task {} failed: {}", task.id, e);
            }
        }

        FrameResult {
            id: task.id,
            frame: task.frame,
            outcome,
            latency,
            inline,
        }
    }

    async fn infer(&self, task: &Task) -> Result<Vec<Detection>> {
        if let Some(batcher) = &self.batcher {
            if (task.target_width, task.target_height) == self.processor.codec().input_size() {
                return batcher.detect(task.frame.clone()).await;
            }
        }

        let processor = self.processor.clone();
        let frame = task.frame.clone();
        let (width, height) = (task.target_width, task.target_height);
        match tokio::task::spawn_blocking(move || processor.detect_at(&frame, width, height)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Inference task for {} ended abnormally: {}", task.id, e);
                Err(Error::Inference(format!("inference task failed: {}", e)))
            }
        }
    }

    async fn deliver_cancelled(&self, task: Task) {
        self.metrics.record_cancelled();
        let result = FrameResult {
            id: task.id,
            frame: task.frame,
            outcome: Err(Error::ShutDown),
            latency: Duration::ZERO,
            inline: false,
        };
        self.results.deliver(result).await;
    }

    fn check_health(&self) -> HealthReport {
        self.health.evaluate(HealthInputs {
            circuit_state: self.breaker.state(),
            resources_ok: self.resources.within_limits(),
            queue_len: self.pending.load(Ordering::SeqCst),
            queue_capacity: self.queue_capacity,
        })
    }

    fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.pending.load(Ordering::SeqCst),
            capacity: self.queue_capacity,
            results: self.results.len(),
            result_capacity: self.results.capacity(),
            available_workers: self.permits.available_permits(),
            parallelism: self.parallelism,
        }
    }
}

/// Concurrent detection pipeline.
///
/// `submit` never blocks on a full queue: the frame is processed on the
/// caller's path instead and its result handed straight back. Queued
/// results arrive out of order on the result channel; re-sequence by
/// frame number if order matters.
pub struct Pipeline {
    shared: Arc<Shared>,
    config: PipelineConfig,
    task_tx: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
}

impl Pipeline {
    /// Start the workers. Must be called within a tokio runtime.
    pub fn new(processor: FrameProcessor, config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_memory_probe(processor, config, Arc::new(SystemMemoryProbe::new()))
    }

    pub fn with_memory_probe(
        processor: FrameProcessor,
        config: PipelineConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> PipelineResult<Self> {
        config.validate().map_err(PipelineError::Config)?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PipelineError::Config(
                "Pipeline must be created inside a tokio runtime".to_string(),
            ));
        }

        let metrics = Arc::new(PerformanceMetrics::new());
        let queue_capacity = config.effective_queue_capacity();
        let (task_tx, task_rx) = mpsc::channel(queue_capacity);
        let batch_size = config.effective_batch_size();
        if config.batching && batch_size < config.max_batch_size {
            info!(
                "Batch size capped at {} (parallelism), max_batch_size is {}",
                batch_size, config.max_batch_size
            );
        }
        let batcher = config
            .batching
            .then(|| BatchAssembler::new(processor.clone(), batch_size, config.batch_flush_timeout));

        let shared = Arc::new(Shared {
            processor,
            batcher,
            permits: Arc::new(Semaphore::new(config.parallelism)),
            parallelism: config.parallelism,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            limiter: RateLimiter::new(config.rate_limiter.clone()),
            resources: Arc::new(ResourceMonitor::with_probe(config.resource_limits.clone(), probe)),
            health: HealthChecker::new(config.health.clone()),
            results: ResultChannel::new(config.effective_result_capacity(), config.backpressure, metrics.clone()),
            metrics,
            queue_capacity,
            pending: AtomicUsize::new(0),
        });

        let cancel = CancellationToken::new();
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let workers = (0..config.parallelism)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, shared.clone(), task_rx.clone(), cancel.clone())))
            .collect();
        let background = vec![
            shared.resources.spawn_sampler(cancel.clone()),
            spawn_health_loop(shared.clone(), config.health.check_interval, cancel.clone()),
        ];

        info!(
            "Pipeline started: {} workers, queue capacity {}, result capacity {}, backpressure {:?}, batching {}",
            config.parallelism,
            queue_capacity,
            config.effective_result_capacity(),
            config.backpressure,
            config.batching
        );

        Ok(Self {
            shared,
            config,
            task_tx: parking_lot::Mutex::new(Some(task_tx)),
            task_rx,
            workers: parking_lot::Mutex::new(workers),
            background: parking_lot::Mutex::new(background),
            cancel,
            shutting_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.shared.processor
    }

    /// Submit at the processor's model input size.
    pub async fn submit(&self, frame: Frame) -> Result<Submission> {
        let (width, height) = self.shared.processor.codec().input_size();
        self.submit_with_target(frame, width, height).await
    }

    /// Queue a frame, or process it inline when the queue is full.
    pub async fn submit_with_target(&self, frame: Frame, target_width: u32, target_height: u32) -> Result<Submission> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id,
            frame,
            target_width,
            target_height,
        };

        let task = {
            let sender = self.task_tx.lock();
            let tx = match sender.as_ref() {
                Some(tx) if !self.shutting_down.load(Ordering::SeqCst) => tx,
                _ => return Err(Error::ShutDown),
            };

            // counted before the send so a fast worker never sees zero
            let depth = self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1;
            match tx.try_send(task) {
                Ok(()) => {
                    self.shared.metrics.record_queue_depth(depth);
                    return Ok(Submission::Queued { id });
                }
                Err(TrySendError::Full(task)) => {
                    self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                    task
                }
                Err(TrySendError::Closed(_)) => {
                    self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::ShutDown);
                }
            }
        };

        debug!("task queue full, processing task {} inline", id);
        self.shared.metrics.record_inline_fallback();
        Ok(Submission::Inline(self.shared.run(task, true).await))
    }

    /// Wait for the next queued result. `None` after shutdown once every
    /// result has been taken.
    pub async fn next_result(&self) -> Option<FrameResult> {
        self.shared.results.recv().await
    }

    /// Next queued result if one is ready
    pub fn try_next_result(&self) -> Option<FrameResult> {
        self.shared.results.try_recv()
    }

    /// Ids of queued tasks whose results the backpressure policy
    /// discarded since the last call. Only the most recent drops are kept.
    pub fn take_dropped_ids(&self) -> Vec<u64> {
        self.shared.results.take_dropped_ids()
    }

    pub fn has_pending_results(&self) -> bool {
        self.shared.results.len() > 0
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.shared.queue_status()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.shared.breaker.state()
    }

    /// Run a health evaluation now, outside the periodic schedule.
    pub fn check_health(&self) -> HealthReport {
        self.shared.check_health()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.health.is_healthy()
    }

    pub fn performance(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn stability_snapshot(&self) -> StabilitySnapshot {
        StabilitySnapshot {
            circuit_breaker: self.shared.breaker.snapshot(),
            rate_limiter: self.shared.limiter.snapshot(),
            resource_monitor: self.shared.resources.snapshot(),
            health_checker: self.shared.health.snapshot(),
            performance_metrics: self.shared.metrics.snapshot(),
            queue: self.queue_status(),
        }
    }

    /// Flat numeric view for observability collaborators
    pub fn metrics_snapshot(&self) -> HashMap<String, f64> {
        let snapshot = self.stability_snapshot();
        let mut map = snapshot.performance_metrics.to_map();

        let circuit = match snapshot.circuit_breaker.state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        map.insert("circuit_state".to_string(), circuit);
        map.insert(
            "circuit_failure_count".to_string(),
            snapshot.circuit_breaker.failure_count as f64,
        );
        map.insert("rate_limiter_tokens".to_string(), snapshot.rate_limiter.tokens);
        map.insert("active_tasks".to_string(), snapshot.resource_monitor.active_tasks as f64);
        if let Some(memory) = snapshot.resource_monitor.memory_bytes {
            map.insert("memory_bytes".to_string(), memory as f64);
        }
        map.insert("healthy".to_string(), if snapshot.health_checker.healthy { 1.0 } else { 0.0 });
        map.insert("queue_pending".to_string(), snapshot.queue.pending as f64);
        map.insert("queue_results".to_string(), snapshot.queue.results as f64);
        map.insert("available_workers".to_string(), snapshot.queue.available_workers as f64);
        map
    }

    /// Operator reset: close the circuit, refill the token bucket, zero
    /// the counters and mark healthy.
    pub fn reset_stability_metrics(&self) {
        self.shared.breaker.reset();
        self.shared.limiter.reset();
        self.shared.metrics.reset();
        self.shared.health.reset();
        info!("Stability metrics reset");
    }

    pub fn set_rate_limit(&self, config: RateLimiterConfig) -> PipelineResult<()> {
        validate_rate_limit(&config).map_err(PipelineError::Config)?;
        self.shared.limiter.set_limits(config);
        Ok(())
    }

    pub fn set_circuit_breaker(&self, config: CircuitBreakerConfig) -> PipelineResult<()> {
        if config.max_failures == 0 {
            return Err(PipelineError::Config(
                "circuit_breaker.max_failures must be at least 1".to_string(),
            ));
        }
        self.shared.breaker.set_config(config);
        Ok(())
    }

    pub fn set_resource_limits(&self, limits: ResourceLimits) -> PipelineResult<()> {
        if limits.max_memory_bytes == 0 || limits.max_active_tasks == 0 {
            return Err(PipelineError::Config("resource limits must be non-zero".to_string()));
        }
        self.shared.resources.set_limits(limits);
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop workers from taking new tasks, let in-flight tasks finish,
    /// then close the queue and report every still-queued task as
    /// cancelled. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Pipeline shutting down");
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }

        // every worker has exited; closing the queue cannot race a send
        drop(self.task_tx.lock().take());
        let drained: Vec<Task> = {
            let mut rx = self.task_rx.lock().await;
            rx.close();
            let mut drained = Vec::new();
            while let Ok(task) = rx.try_recv() {
                drained.push(task);
            }
            drained
        };
        if !drained.is_empty() {
            warn!("{} queued tasks cancelled by shutdown", drained.len());
        }
        for task in drained {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            self.shared.deliver_cancelled(task).await;
        }

        if let Some(batcher) = &self.shared.batcher {
            batcher.shutdown().await;
        }
        self.shared.permits.close();

        let background = std::mem::take(&mut *self.background.lock());
        for handle in background {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        self.shared.results.close();
        info!("Pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.results.close();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("parallelism", &self.config.parallelism)
            .field("queue", &self.queue_status())
            .field("circuit", &self.circuit_state())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    tasks: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    cancel: CancellationToken,
) {
    debug!("worker {} started", worker_id);
    loop {
        let task = {
            let mut rx = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                rx = tasks.lock() => rx,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };
        shared.pending.fetch_sub(1, Ordering::SeqCst);

        let permit = match shared.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                shared.deliver_cancelled(task).await;
                break;
            }
        };
        let result = shared.run(task, false).await;
        drop(permit);

        shared.results.deliver(result).await;
    }
    debug!("worker {} stopped", worker_id);
}

fn spawn_health_loop(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    shared.check_health();
                }
            }
        }
        debug!("health checker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_monitor::ManualMemoryProbe;
    use kestrel_core::Tensor;
    use kestrel_vision::{DetectionOptions, DetectorConfig, FixedOutputEngine, InferenceEngine};

    struct ToggleEngine {
        inner: FixedOutputEngine,
        fail: AtomicBool,
    }

    impl InferenceEngine for ToggleEngine {
        fn name(&self) -> &str {
            "toggle"
        }

        fn infer(&self, input: &Tensor) -> Result<Tensor> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Inference("engine offline".to_string()));
            }
            self.inner.infer(input)
        }
    }

    fn toggle_engine() -> Arc<ToggleEngine> {
        Arc::new(ToggleEngine {
            inner: FixedOutputEngine::single_box(2, 8, (0.0, 0.0, 16.0, 16.0), 0, 0.9).unwrap(),
            fail: AtomicBool::new(false),
        })
    }

    fn processor(engine: Arc<dyn InferenceEngine>) -> FrameProcessor {
        let config = DetectorConfig::default()
            .with_input_size(32)
            .with_class_names(["a", "b"]);
        FrameProcessor::new(&config, engine, DetectionOptions::default()).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::for_parallelism(2, 4)
            .with_rate_limiter(RateLimiterConfig {
                max_tokens: 1000.0,
                refill_rate: 1000.0,
            })
            .with_circuit_breaker(CircuitBreakerConfig {
                max_failures: 3,
                retry_timeout: Duration::from_secs(5),
            })
    }

    fn pipeline(engine: Arc<dyn InferenceEngine>, config: PipelineConfig) -> Pipeline {
        Pipeline::with_memory_probe(processor(engine), config, Arc::new(ManualMemoryProbe::new(0))).unwrap()
    }

    fn frame(n: u64) -> Frame {
        Frame::solid(32, 32, [0, 0, 0], n, Duration::from_millis(n * 40)).unwrap()
    }

    async fn collect(pipeline: &Pipeline, submissions: Vec<Submission>) -> Vec<FrameResult> {
        let mut results = Vec::new();
        let mut queued = 0;
        for submission in submissions {
            match submission {
                Submission::Queued { .. } => queued += 1,
                Submission::Inline(result) => results.push(result),
            }
        }
        for _ in 0..queued {
            results.push(pipeline.next_result().await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_submit_and_receive() {
        let pipeline = pipeline(toggle_engine(), config());
        let mut submissions = Vec::new();
        for n in 0..5 {
            submissions.push(pipeline.submit(frame(n)).await.unwrap());
        }

        let mut results = collect(&pipeline, submissions).await;
        results.sort_by_key(|r| r.frame_number());
        assert_eq!(results.len(), 5);
        for (n, result) in results.iter().enumerate() {
            assert_eq!(result.frame_number(), n as u64);
            assert_eq!(result.detections().map(|d| d.len()), Some(1));
        }
        assert_eq!(pipeline.performance().successful_requests, 5);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_open_circuit() {
        let engine = toggle_engine();
        engine.fail.store(true, Ordering::SeqCst);
        let pipeline = pipeline(engine.clone(), config());

        for n in 0..3 {
            let submission = pipeline.submit(frame(n)).await.unwrap();
            let result = match submission {
                Submission::Inline(result) => result,
                Submission::Queued { .. } => pipeline.next_result().await.unwrap(),
            };
            assert!(matches!(result.error(), Some(Error::Inference(_))));
        }
        assert_eq!(pipeline.circuit_state(), CircuitState::Open);

        let submission = pipeline.submit(frame(3)).await.unwrap();
        let result = match submission {
            Submission::Inline(result) => result,
            Submission::Queued { .. } => pipeline.next_result().await.unwrap(),
        };
        assert_eq!(result.error(), Some(&Error::AdmissionRejected(RejectReason::CircuitOpen)));

        let snap = pipeline.performance();
        assert_eq!(snap.failed_requests, 3);
        assert_eq!(snap.rejected_circuit_open, 1);

        pipeline.reset_stability_metrics();
        assert_eq!(pipeline.circuit_state(), CircuitState::Closed);
        assert_eq!(pipeline.performance().total_requests, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_rejections() {
        let engine = toggle_engine();
        let config = config().with_rate_limiter(RateLimiterConfig {
            max_tokens: 2.0,
            refill_rate: 0.0,
        });
        let pipeline = pipeline(engine, config);

        let mut submissions = Vec::new();
        for n in 0..4 {
            submissions.push(pipeline.submit(frame(n)).await.unwrap());
        }
        let results = collect(&pipeline, submissions).await;
        let rejected = results
            .iter()
            .filter(|r| r.error() == Some(&Error::AdmissionRejected(RejectReason::RateLimited)))
            .count();
        assert_eq!(rejected, 2);
        assert_eq!(pipeline.performance().rejected_rate_limited, 2);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_runtime_retuning() {
        let pipeline = pipeline(toggle_engine(), config());
        assert!(pipeline
            .set_rate_limit(RateLimiterConfig {
                max_tokens: 0.0,
                refill_rate: 1.0
            })
            .is_err());
        assert!(pipeline
            .set_circuit_breaker(CircuitBreakerConfig {
                max_failures: 0,
                retry_timeout: Duration::from_secs(1)
            })
            .is_err());
        pipeline
            .set_rate_limit(RateLimiterConfig {
                max_tokens: 5.0,
                refill_rate: 1.0,
            })
            .unwrap();
        assert_eq!(pipeline.stability_snapshot().rate_limiter.max_tokens, 5.0);
        pipeline
            .set_resource_limits(ResourceLimits::for_parallelism(4))
            .unwrap();
        assert_eq!(pipeline.stability_snapshot().resource_monitor.max_active_tasks, 8);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_snapshots() {
        let pipeline = pipeline(toggle_engine(), config());
        let status = pipeline.queue_status();
        assert_eq!(status.capacity, 8);
        assert_eq!(status.parallelism, 2);
        assert_eq!(status.pending, 0);
        assert!(!pipeline.has_pending_results());

        let report = pipeline.check_health();
        assert!(report.healthy && report.all_ok());

        let map = pipeline.metrics_snapshot();
        assert_eq!(map["circuit_state"], 0.0);
        assert_eq!(map["healthy"], 1.0);
        assert_eq!(map["active_tasks"], 0.0);
        assert!(map.get("memory_bytes").map_or(true, |m| *m == 0.0));

        let json = serde_json::to_value(pipeline.stability_snapshot()).unwrap();
        assert_eq!(json["circuit_breaker"]["state"], "closed");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_new_work() {
        let pipeline = pipeline(toggle_engine(), config());
        let submission = pipeline.submit(frame(0)).await.unwrap();
        if let Submission::Queued { .. } = submission {
            assert!(pipeline.next_result().await.is_some());
        }

        pipeline.shutdown().await;
        pipeline.shutdown().await;
        assert!(pipeline.is_shut_down());
        assert_eq!(pipeline.submit(frame(1)).await.unwrap_err(), Error::ShutDown);
        assert!(pipeline.next_result().await.is_none());
    }

    #[tokio::test]
    async fn test_batching_path() {
        let config = config().with_batching(true).with_batch_flush_timeout(Duration::from_millis(5));
        let pipeline = pipeline(toggle_engine(), config);
        let mut submissions = Vec::new();
        for n in 0..4 {
            submissions.push(pipeline.submit(frame(n)).await.unwrap());
        }
        let results = collect(&pipeline, submissions).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_ok()));
        pipeline.shutdown().await;
    }

    /// Records the size of every batched call
    struct BatchRecorder {
        inner: FixedOutputEngine,
        batches: parking_lot::Mutex<Vec<usize>>,
    }

    impl InferenceEngine for BatchRecorder {
        fn name(&self) -> &str {
            "batch-recorder"
        }

        fn infer(&self, input: &Tensor) -> Result<Tensor> {
            self.inner.infer(input)
        }

        fn infer_batch(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            self.batches.lock().push(inputs.len());
            inputs.iter().map(|i| self.inner.infer(i)).collect()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_batch_forms_with_default_shape() {
        let engine = Arc::new(BatchRecorder {
            inner: FixedOutputEngine::single_box(2, 8, (0.0, 0.0, 16.0, 16.0), 0, 0.9).unwrap(),
            batches: parking_lot::Mutex::new(Vec::new()),
        });
        // default shape: twice as many batch slots as workers
        let config = config()
            .with_batching(true)
            .with_batch_flush_timeout(Duration::from_secs(30));
        assert_eq!(config.effective_batch_size(), 2);
        let pipeline = pipeline(engine.clone(), config);

        let mut submissions = Vec::new();
        for n in 0..4 {
            submissions.push(pipeline.submit(frame(n)).await.unwrap());
        }
        // only full batches flush before the long timeout
        let results = tokio::time::timeout(Duration::from_secs(5), collect(&pipeline, submissions))
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(*engine.batches.lock(), vec![2, 2]);
        pipeline.shutdown().await;
    }

    #[test]
    fn test_requires_runtime() {
        let result = Pipeline::new(processor(toggle_engine()), config());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
