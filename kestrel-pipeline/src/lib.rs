//! kestrel-pipeline: concurrent detection over frame streams
//!
//! A bounded task queue feeds a fixed set of workers that share one
//! [`FrameProcessor`](kestrel_vision::FrameProcessor). Admission passes
//! a resource monitor, a token-bucket rate limiter and a circuit breaker;
//! results come back on a bounded channel whose backpressure policy is
//! configurable. [`Detector`] wraps all of it behind a frame source and
//! an optional per-frame callback.

pub mod batch;
pub mod circuit_breaker;
pub mod config;
mod delivery;
pub mod detector;
pub mod error;
pub mod health;
pub mod performance;
pub mod pool;
pub mod rate_limiter;
pub mod resource_monitor;
pub mod source;
pub mod task;

pub use batch::BatchAssembler;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use config::{
    BackpressurePolicy, CircuitBreakerConfig, HealthConfig, PipelineConfig, RateLimiterConfig, ResourceLimits,
};
pub use delivery::Delivery;
pub use detector::{DetectionCallback, DetectionResults, Detector, ImageResult, VideoFrameResult};
pub use error::{PipelineError, Result};
pub use health::{HealthChecker, HealthInputs, HealthReport, HealthSnapshot};
pub use performance::{MetricsSnapshot, PerformanceMetrics};
pub use pool::{Pipeline, QueueStatus, StabilitySnapshot};
pub use rate_limiter::{RateLimiter, RateLimiterSnapshot};
pub use resource_monitor::{
    ActiveTaskGuard, ManualMemoryProbe, MemoryProbe, ResourceMonitor, ResourceSample, ResourceSnapshot,
    SystemMemoryProbe,
};
pub use source::{frame_channel, ChannelFrameSource, FrameSender, FrameSource, VecFrameSource};
pub use task::{FrameResult, Submission, Task};
