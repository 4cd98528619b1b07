//! Pipeline configuration

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Durations are written as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

fn default_parallelism() -> usize {
    num_cpus::get().max(1) * 2
}

fn default_max_batch_size() -> usize {
    num_cpus::get().max(1) * 4
}

/// What happens to a finished result when the result channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Discard the result that could not be delivered
    DropNewest,
    /// Evict the oldest undelivered result to make room
    DropOldest,
    /// Wait up to the timeout for room, then discard
    BlockWithTimeout(#[serde(with = "duration_ms")] Duration),
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropNewest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit
    pub max_failures: u32,
    /// How long the circuit stays open before a trial is allowed
    #[serde(with = "duration_ms")]
    pub retry_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            retry_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Bucket size (burst)
    pub max_tokens: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl RateLimiterConfig {
    pub fn for_parallelism(parallelism: usize) -> Self {
        Self {
            max_tokens: (parallelism * 10) as f64,
            refill_rate: parallelism as f64,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::for_parallelism(default_parallelism())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Resident memory ceiling for the process
    pub max_memory_bytes: u64,
    /// Ceiling on concurrently running detection tasks
    pub max_active_tasks: usize,
    /// Background sampling period
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
}

impl ResourceLimits {
    pub fn for_parallelism(parallelism: usize) -> Self {
        Self {
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_active_tasks: parallelism * 2,
            sample_interval: Duration::from_secs(1),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::for_parallelism(default_parallelism())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Consecutive unhealthy checks before the pipeline reports unhealthy
    pub max_failures: u32,
    /// Pending-queue occupancy (fraction of capacity) considered overloaded
    pub queue_high_water: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            max_failures: 5,
            queue_high_water: 0.8,
        }
    }
}

/// Scheduling and resilience settings for one pipeline instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker count and concurrent inference permits
    pub parallelism: usize,
    /// Largest batch handed to the engine in one call, capped at
    /// `parallelism` when batching
    pub max_batch_size: usize,
    /// Pending-task capacity (0 = 2 x max_batch_size)
    pub queue_capacity: usize,
    /// Result channel capacity (0 = same as the task queue)
    pub result_capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Route queued frames through the batch assembler
    pub batching: bool,
    /// Early flush for partially filled batches
    #[serde(with = "duration_ms")]
    pub batch_flush_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limiter: RateLimiterConfig,
    pub resource_limits: ResourceLimits,
    pub health: HealthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::for_parallelism(default_parallelism(), default_max_batch_size())
    }
}

impl PipelineConfig {
    /// Defaults scaled to the given worker count and batch size
    pub fn for_parallelism(parallelism: usize, max_batch_size: usize) -> Self {
        Self {
            parallelism,
            max_batch_size,
            queue_capacity: 0,
            result_capacity: 0,
            backpressure: BackpressurePolicy::default(),
            batching: false,
            batch_flush_timeout: Duration::from_millis(10),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::for_parallelism(parallelism),
            resource_limits: ResourceLimits::for_parallelism(parallelism),
            health: HealthConfig::default(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    pub fn with_batch_flush_timeout(mut self, timeout: Duration) -> Self {
        self.batch_flush_timeout = timeout;
        self
    }

    /// Pending-task capacity after applying the derived default
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            (self.max_batch_size * 2).max(1)
        } else {
            self.queue_capacity
        }
    }

    /// Result channel capacity after applying the derived default
    pub fn effective_result_capacity(&self) -> usize {
        if self.result_capacity == 0 {
            self.effective_queue_capacity()
        } else {
            self.result_capacity
        }
    }

    /// Batch size the assembler actually waits for. Every frame in a
    /// batch holds a worker until the batch replies, so a batch can never
    /// grow past `parallelism`.
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.min(self.parallelism).max(1)
    }

    /// Load from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate().map_err(PipelineError::Config)?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by `KESTREL_PARALLELISM` and
    /// `KESTREL_MAX_BATCH_SIZE` when set.
    pub fn from_env() -> Self {
        let parallelism = std::env::var("KESTREL_PARALLELISM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&p| p > 0)
            .unwrap_or_else(default_parallelism);
        let max_batch_size = std::env::var("KESTREL_MAX_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&b| b > 0)
            .unwrap_or_else(default_max_batch_size);
        Self::for_parallelism(parallelism, max_batch_size)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.parallelism == 0 {
            return Err("parallelism must be at least 1".to_string());
        }

        if self.parallelism > 1024 {
            return Err("parallelism too large (max 1024)".to_string());
        }

        if self.max_batch_size == 0 {
            return Err("max_batch_size must be at least 1".to_string());
        }

        if let BackpressurePolicy::BlockWithTimeout(timeout) = self.backpressure {
            if timeout.is_zero() {
                return Err("block_with_timeout needs a non-zero timeout".to_string());
            }
        }

        if self.batch_flush_timeout.is_zero() {
            return Err("batch_flush_timeout must be non-zero".to_string());
        }

        if self.circuit_breaker.max_failures == 0 {
            return Err("circuit_breaker.max_failures must be at least 1".to_string());
        }

        validate_rate_limit(&self.rate_limiter)?;

        if self.resource_limits.max_memory_bytes == 0 || self.resource_limits.max_active_tasks == 0 {
            return Err("resource limits must be non-zero".to_string());
        }

        if self.resource_limits.sample_interval.is_zero() {
            return Err("resource_limits.sample_interval must be non-zero".to_string());
        }

        if self.health.check_interval.is_zero() {
            return Err("health.check_interval must be non-zero".to_string());
        }

        if self.health.max_failures == 0 {
            return Err("health.max_failures must be at least 1".to_string());
        }

        if !(self.health.queue_high_water > 0.0 && self.health.queue_high_water <= 1.0) {
            return Err("health.queue_high_water must be in (0, 1]".to_string());
        }

        Ok(())
    }
}

pub(crate) fn validate_rate_limit(config: &RateLimiterConfig) -> std::result::Result<(), String> {
    if !config.max_tokens.is_finite() || config.max_tokens < 1.0 {
        return Err("rate_limiter.max_tokens must be at least 1".to_string());
    }
    if !config.refill_rate.is_finite() || config.refill_rate < 0.0 {
        return Err("rate_limiter.refill_rate must be non-negative".to_string());
    }
    Ok(())
}
