use kestrel_core::{Error, Frame, RejectReason, Result, Tensor};
use kestrel_pipeline::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, FrameResult, HealthChecker, HealthConfig, HealthInputs,
    ManualMemoryProbe, Pipeline, PipelineConfig, RateLimiter, RateLimiterConfig, ResourceLimits, Submission,
};
use kestrel_vision::{DetectionOptions, DetectorConfig, FixedOutputEngine, FrameProcessor, InferenceEngine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails every call while `failing` is set.
struct FlakyEngine {
    inner: FixedOutputEngine,
    failing: AtomicBool,
}

impl InferenceEngine for FlakyEngine {
    fn name(&self) -> &str {
        "flaky"
    }

    fn infer(&self, input: &Tensor) -> Result<Tensor> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Inference("accelerator reset".to_string()));
        }
        self.inner.infer(input)
    }
}

fn flaky_engine(failing: bool) -> Arc<FlakyEngine> {
    Arc::new(FlakyEngine {
        inner: FixedOutputEngine::single_box(2, 8, (0.0, 0.0, 16.0, 16.0), 0, 0.9).unwrap(),
        failing: AtomicBool::new(failing),
    })
}

fn processor(engine: Arc<dyn InferenceEngine>) -> FrameProcessor {
    let config = DetectorConfig::default()
        .with_input_size(32)
        .with_class_names(["a", "b"]);
    FrameProcessor::new(&config, engine, DetectionOptions::default()).unwrap()
}

fn frame(n: u64) -> Frame {
    Frame::solid(32, 32, [0, 0, 0], n, Duration::ZERO).unwrap()
}

async fn run_one(pipeline: &Pipeline, n: u64) -> FrameResult {
    match pipeline.submit(frame(n)).await.unwrap() {
        Submission::Inline(result) => result,
        Submission::Queued { .. } => pipeline.next_result().await.unwrap(),
    }
}

#[tokio::test]
async fn test_circuit_breaker_through_pipeline() {
    let engine = flaky_engine(true);
    let config = PipelineConfig::for_parallelism(1, 1)
        .with_rate_limiter(RateLimiterConfig {
            max_tokens: 100.0,
            refill_rate: 100.0,
        })
        .with_circuit_breaker(CircuitBreakerConfig {
            max_failures: 3,
            retry_timeout: Duration::from_millis(100),
        });
    let pipeline = Pipeline::new(processor(engine.clone()), config).unwrap();

    for n in 0..3 {
        let result = run_one(&pipeline, n).await;
        assert!(matches!(result.error(), Some(Error::Inference(_))));
    }
    assert_eq!(pipeline.circuit_state(), CircuitState::Open);

    let rejected = run_one(&pipeline, 3).await;
    assert!(rejected.was_rejected());
    assert_eq!(rejected.error().and_then(Error::reject_reason), Some(RejectReason::CircuitOpen));

    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.failing.store(false, Ordering::SeqCst);

    let trial = run_one(&pipeline, 4).await;
    assert!(trial.is_ok());
    assert_eq!(pipeline.circuit_state(), CircuitState::Closed);
    assert_eq!(pipeline.stability_snapshot().circuit_breaker.failure_count, 0);

    let snapshot = pipeline.performance();
    assert_eq!(snapshot.failed_requests, 3);
    assert_eq!(snapshot.rejected_circuit_open, 1);
    assert_eq!(snapshot.successful_requests, 1);
    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        max_failures: 2,
        retry_timeout: Duration::from_secs(5),
    });
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(breaker.try_acquire().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    // only one trial at a time
    assert_eq!(breaker.try_acquire(), Err(RejectReason::CircuitOpen));

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(breaker.try_acquire(), Err(RejectReason::CircuitOpen));
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(breaker.try_acquire().is_ok());
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_burst_then_refill() {
    let limiter = RateLimiter::new(RateLimiterConfig {
        max_tokens: 10.0,
        refill_rate: 5.0,
    });

    let admitted = (0..15).filter(|_| limiter.try_acquire()).count();
    assert_eq!(admitted, 10);

    tokio::time::advance(Duration::from_secs(1)).await;
    let admitted = (0..15).filter(|_| limiter.try_acquire()).count();
    assert_eq!(admitted, 5);

    // never refills past the burst size
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!((limiter.available_tokens() - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_memory_ceiling_rejects_regardless_of_other_gates() {
    let probe = Arc::new(ManualMemoryProbe::new(4 * 1024 * 1024 * 1024));
    let config = PipelineConfig::for_parallelism(2, 2)
        .with_rate_limiter(RateLimiterConfig {
            max_tokens: 100.0,
            refill_rate: 100.0,
        })
        .with_resource_limits(ResourceLimits {
            max_memory_bytes: 1024 * 1024 * 1024,
            ..ResourceLimits::for_parallelism(2)
        });
    let pipeline = Pipeline::with_memory_probe(processor(flaky_engine(false)), config, probe.clone()).unwrap();

    for n in 0..3 {
        let result = run_one(&pipeline, n).await;
        assert_eq!(
            result.error().and_then(Error::reject_reason),
            Some(RejectReason::ResourceExceeded)
        );
    }
    let snapshot = pipeline.performance();
    assert_eq!(snapshot.rejected_resource, 3);
    assert_eq!(snapshot.rejected_rate_limited, 0);
    // rejected work spends no tokens
    assert!((pipeline.stability_snapshot().rate_limiter.tokens - 100.0).abs() < 1.0);
    assert!(!pipeline.check_health().resources_ok);

    probe.set(512 * 1024 * 1024);
    assert!(run_one(&pipeline, 3).await.is_ok());
    assert!(pipeline.check_health().resources_ok);
    pipeline.shutdown().await;
}

#[test]
fn test_health_flips_after_consecutive_failures() {
    let checker = HealthChecker::new(HealthConfig {
        max_failures: 3,
        ..HealthConfig::default()
    });
    let bad = HealthInputs {
        circuit_state: CircuitState::Open,
        resources_ok: true,
        queue_len: 0,
        queue_capacity: 10,
    };
    let good = HealthInputs {
        circuit_state: CircuitState::Closed,
        resources_ok: true,
        queue_len: 7,
        queue_capacity: 10,
    };

    checker.evaluate(bad);
    checker.evaluate(bad);
    assert!(checker.is_healthy());
    let report = checker.evaluate(bad);
    assert!(!report.healthy);
    assert!(!report.circuit_ok);

    let report = checker.evaluate(good);
    assert!(report.healthy);
    assert_eq!(report.consecutive_failures, 0);

    // 80% occupancy is a failed check
    let crowded = HealthInputs { queue_len: 8, ..good };
    assert!(!checker.evaluate(crowded).queue_ok);
}

#[tokio::test]
async fn test_reset_restores_clean_state() {
    let engine = flaky_engine(true);
    let config = PipelineConfig::for_parallelism(1, 1).with_circuit_breaker(CircuitBreakerConfig {
        max_failures: 1,
        retry_timeout: Duration::from_secs(60),
    });
    let pipeline = Pipeline::new(processor(engine.clone()), config).unwrap();

    run_one(&pipeline, 0).await;
    assert_eq!(pipeline.circuit_state(), CircuitState::Open);

    pipeline.reset_stability_metrics();
    let snapshot = pipeline.stability_snapshot();
    assert_eq!(snapshot.circuit_breaker.state, CircuitState::Closed);
    assert_eq!(snapshot.performance_metrics.total_requests, 0);
    assert!(snapshot.health_checker.healthy);

    engine.failing.store(false, Ordering::SeqCst);
    assert!(run_one(&pipeline, 1).await.is_ok());
    pipeline.shutdown().await;
}
