//! Latency and throughput counters

use kestrel_core::RejectReason;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Counters {
    total: u64,
    succeeded: u64,
    failed: u64,
    rejected_circuit_open: u64,
    rejected_rate_limited: u64,
    rejected_resource: u64,
    inline_fallbacks: u64,
    dropped_results: u64,
    cancelled: u64,
    latency_total: Duration,
    latency_min: Option<Duration>,
    latency_max: Duration,
    since: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            rejected_circuit_open: 0,
            rejected_rate_limited: 0,
            rejected_resource: 0,
            inline_fallbacks: 0,
            dropped_results: 0,
            cancelled: 0,
            latency_total: Duration::ZERO,
            latency_min: None,
            latency_max: Duration::ZERO,
            since: Instant::now(),
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        self.latency_total += latency;
        self.latency_min = Some(self.latency_min.map_or(latency, |m| m.min(latency)));
        self.latency_max = self.latency_max.max(latency);
    }
}

/// Copy of the counters at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_circuit_open: u64,
    pub rejected_rate_limited: u64,
    pub rejected_resource: u64,
    pub inline_fallbacks: u64,
    pub dropped_results: u64,
    pub cancelled: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Completed frames per second since construction or last reset
    pub throughput_per_sec: f64,
}

impl MetricsSnapshot {
    pub fn rejected_total(&self) -> u64 {
        self.rejected_circuit_open + self.rejected_rate_limited + self.rejected_resource
    }

    /// Flat `name -> value` view
    pub fn to_map(&self) -> HashMap<String, f64> {
        let mut map = HashMap::new();
        map.insert("total_requests".to_string(), self.total_requests as f64);
        map.insert("successful_requests".to_string(), self.successful_requests as f64);
        map.insert("failed_requests".to_string(), self.failed_requests as f64);
        map.insert("rejected_circuit_open".to_string(), self.rejected_circuit_open as f64);
        map.insert("rejected_rate_limited".to_string(), self.rejected_rate_limited as f64);
        map.insert("rejected_resource".to_string(), self.rejected_resource as f64);
        map.insert("inline_fallbacks".to_string(), self.inline_fallbacks as f64);
        map.insert("dropped_results".to_string(), self.dropped_results as f64);
        map.insert("cancelled".to_string(), self.cancelled as f64);
        map.insert("avg_latency_ms".to_string(), self.avg_latency_ms);
        map.insert("min_latency_ms".to_string(), self.min_latency_ms);
        map.insert("max_latency_ms".to_string(), self.max_latency_ms);
        map.insert("throughput_per_sec".to_string(), self.throughput_per_sec);
        map
    }
}

/// Per-pipeline counters, also exported through the `metrics` facade.
#[derive(Debug)]
pub struct PerformanceMetrics {
    counters: RwLock<Counters>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(Counters::new()),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        {
            let mut c = self.counters.write();
            c.total += 1;
            c.succeeded += 1;
            c.record_latency(latency);
        }
        counter!("kestrel_frames_total", "outcome" => "success").increment(1);
        histogram!("kestrel_inference_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn record_failure(&self, latency: Duration) {
        {
            let mut c = self.counters.write();
            c.total += 1;
            c.failed += 1;
            c.record_latency(latency);
        }
        counter!("kestrel_frames_total", "outcome" => "failure").increment(1);
        histogram!("kestrel_inference_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        {
            let mut c = self.counters.write();
            c.total += 1;
            match reason {
                RejectReason::CircuitOpen => c.rejected_circuit_open += 1,
                RejectReason::RateLimited => c.rejected_rate_limited += 1,
                RejectReason::ResourceExceeded => c.rejected_resource += 1,
            }
        }
        counter!("kestrel_frames_rejected_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn record_inline_fallback(&self) {
        self.counters.write().inline_fallbacks += 1;
        counter!("kestrel_inline_fallbacks_total").increment(1);
    }

    pub fn record_dropped_result(&self) {
        self.counters.write().dropped_results += 1;
        counter!("kestrel_results_dropped_total").increment(1);
    }

    pub fn record_cancelled(&self) {
        self.counters.write().cancelled += 1;
        counter!("kestrel_frames_total", "outcome" => "cancelled").increment(1);
    }

    pub fn record_queue_depth(&self, depth: usize) {
        gauge!("kestrel_queue_depth").set(depth as f64);
    }

    /// Explicit operator reset
    pub fn reset(&self) {
        *self.counters.write() = Counters::new();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.read();
        let completed = c.succeeded + c.failed;
        let avg = if completed == 0 {
            0.0
        } else {
            c.latency_total.as_secs_f64() * 1000.0 / completed as f64
        };
        let elapsed = c.since.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 { completed as f64 / elapsed } else { 0.0 };

        MetricsSnapshot {
            total_requests: c.total,
            successful_requests: c.succeeded,
            failed_requests: c.failed,
            rejected_circuit_open: c.rejected_circuit_open,
            rejected_rate_limited: c.rejected_rate_limited,
            rejected_resource: c.rejected_resource,
            inline_fallbacks: c.inline_fallbacks,
            dropped_results: c.dropped_results,
            cancelled: c.cancelled,
            avg_latency_ms: avg,
            min_latency_ms: c.latency_min.map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            max_latency_ms: c.latency_max.as_secs_f64() * 1000.0,
            throughput_per_sec: throughput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_throughput() {
        let m = PerformanceMetrics::new();
        m.record_success(Duration::from_millis(10));
        m.record_success(Duration::from_millis(30));
        m.record_failure(Duration::from_millis(20));
        tokio::time::advance(Duration::from_secs(3)).await;

        let snap = m.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert!((snap.avg_latency_ms - 20.0).abs() < 1e-9);
        assert!((snap.min_latency_ms - 10.0).abs() < 1e-9);
        assert!((snap.max_latency_ms - 30.0).abs() < 1e-9);
        assert!((snap.throughput_per_sec - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejections_are_counted_by_reason() {
        let m = PerformanceMetrics::new();
        m.record_rejection(RejectReason::CircuitOpen);
        m.record_rejection(RejectReason::RateLimited);
        m.record_rejection(RejectReason::RateLimited);
        m.record_dropped_result();
        m.record_inline_fallback();

        let snap = m.snapshot();
        assert_eq!(snap.rejected_circuit_open, 1);
        assert_eq!(snap.rejected_rate_limited, 2);
        assert_eq!(snap.rejected_total(), 3);
        assert_eq!(snap.failed_requests, 0);
        assert_eq!(snap.dropped_results, 1);
        assert_eq!(snap.to_map()["inline_fallbacks"], 1.0);
    }

    #[test]
    fn test_reset() {
        let m = PerformanceMetrics::new();
        m.record_success(Duration::from_millis(5));
        m.record_cancelled();
        m.reset();
        let snap = m.snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.cancelled, 0);
        assert_eq!(snap.min_latency_ms, 0.0);
    }
}
