//! Memory and active-task ceilings

use crate::config::ResourceLimits;
use kestrel_core::RejectReason;
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reads the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the reading is unavailable
    fn resident_bytes(&self) -> Option<u64>;
}

/// Probe backed by `sysinfo`
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, memory ceiling disabled: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }
}

/// Probe reporting whatever value was last set
#[derive(Debug, Default)]
pub struct ManualMemoryProbe {
    bytes: AtomicU64,
}

impl ManualMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_bytes: Option<u64>,
    pub active_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_bytes: Option<u64>,
    pub max_memory_bytes: u64,
    pub active_tasks: usize,
    pub max_active_tasks: usize,
    pub within_limits: bool,
}

/// Counts a running task for as long as it is held.
#[derive(Debug)]
pub struct ActiveTaskGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Vetoes new work while memory or the number of running tasks is over
/// its ceiling. Admission reads live values; the background sampler only
/// feeds reporting.
pub struct ResourceMonitor {
    limits: RwLock<ResourceLimits>,
    probe: Arc<dyn MemoryProbe>,
    active: Arc<AtomicUsize>,
    last_sample: RwLock<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_probe(limits, Arc::new(SystemMemoryProbe::new()))
    }

    pub fn with_probe(limits: ResourceLimits, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            limits: RwLock::new(limits),
            probe,
            active: Arc::new(AtomicUsize::new(0)),
            last_sample: RwLock::new(ResourceSample::default()),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark a task as running until the guard is dropped.
    pub fn track_task(&self) -> ActiveTaskGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveTaskGuard {
            active: self.active.clone(),
        }
    }

    /// Admission check against live readings. A new task is refused when
    /// memory is over the ceiling or the running-task count has already
    /// reached its ceiling. Reserves nothing; see [`try_admit`](Self::try_admit).
    pub fn check_admission(&self) -> Result<(), RejectReason> {
        let limits = self.limits.read().clone();
        self.check_memory(&limits)?;

        let active = self.active_tasks();
        if active >= limits.max_active_tasks {
            debug!("{} active tasks at limit {}", active, limits.max_active_tasks);
            return Err(RejectReason::ResourceExceeded);
        }

        Ok(())
    }

    /// Check the memory ceiling and claim a task slot in one step. The
    /// slot is held until the guard is dropped, so concurrent callers can
    /// never push the count past `max_active_tasks`.
    pub fn try_admit(&self) -> Result<ActiveTaskGuard, RejectReason> {
        let limits = self.limits.read().clone();
        self.check_memory(&limits)?;

        let mut active = self.active.load(Ordering::SeqCst);
        loop {
            if active >= limits.max_active_tasks {
                debug!("{} active tasks at limit {}", active, limits.max_active_tasks);
                return Err(RejectReason::ResourceExceeded);
            }
            match self
                .active
                .compare_exchange_weak(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    return Ok(ActiveTaskGuard {
                        active: self.active.clone(),
                    })
                }
                Err(current) => active = current,
            }
        }
    }

    fn check_memory(&self, limits: &ResourceLimits) -> Result<(), RejectReason> {
        if let Some(memory) = self.probe.resident_bytes() {
            if memory > limits.max_memory_bytes {
                debug!("memory {} over limit {}", memory, limits.max_memory_bytes);
                return Err(RejectReason::ResourceExceeded);
            }
        }
        Ok(())
    }

    /// True when neither ceiling is currently exceeded.
    pub fn within_limits(&self) -> bool {
        let limits = self.limits.read().clone();
        let memory_ok = self
            .probe
            .resident_bytes()
            .map_or(true, |m| m <= limits.max_memory_bytes);
        memory_ok && self.active_tasks() <= limits.max_active_tasks
    }

    /// Take a reading and remember it for reporting.
    pub fn sample(&self) -> ResourceSample {
        let sample = ResourceSample {
            memory_bytes: self.probe.resident_bytes(),
            active_tasks: self.active_tasks(),
        };
        *self.last_sample.write() = sample;

        if let Some(memory) = sample.memory_bytes {
            gauge!("kestrel_memory_bytes").set(memory as f64);
        }
        gauge!("kestrel_active_tasks").set(sample.active_tasks as f64);
        sample
    }

    pub fn last_sample(&self) -> ResourceSample {
        *self.last_sample.read()
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits.read().clone()
    }

    pub fn set_limits(&self, limits: ResourceLimits) {
        info!(
            "Resource limits: max_memory={} bytes, max_active_tasks={}",
            limits.max_memory_bytes, limits.max_active_tasks
        );
        *self.limits.write() = limits;
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let limits = self.limits();
        let sample = self.last_sample();
        ResourceSnapshot {
            memory_bytes: sample.memory_bytes,
            max_memory_bytes: limits.max_memory_bytes,
            active_tasks: self.active_tasks(),
            max_active_tasks: limits.max_active_tasks,
            within_limits: self.within_limits(),
        }
    }

    /// Sample on the configured interval until cancelled.
    pub fn spawn_sampler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = monitor.limits().sample_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
            debug!("resource sampler stopped");
        })
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &*self.limits.read())
            .field("active", &self.active_tasks())
            .finish()
    }
}
