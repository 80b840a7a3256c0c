use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of process resident-memory readings.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// RSS of the current process via `sysinfo`.
pub struct SysinfoProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            debug!("Current pid unavailable, memory readings disabled");
        }
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryReading {
    pub baseline_bytes: u64,
    pub peak_bytes: u64,
    pub final_bytes: u64,
}

impl MemoryReading {
    pub fn peak_mb(&self) -> f64 {
        self.peak_bytes as f64 / BYTES_PER_MB
    }

    /// Signed: memory can be released during a call.
    pub fn delta_gb(&self) -> f64 {
        (self.final_bytes as f64 - self.baseline_bytes as f64) / BYTES_PER_GB
    }
}

/// Memory tracking for exactly one call. The background sampler is stopped
/// by `finish` or, on any early exit, by `Drop`.
pub struct MemoryScope {
    probe: Arc<dyn MemoryProbe>,
    baseline: u64,
    peak: Arc<AtomicU64>,
    sampler: Option<JoinHandle<()>>,
}

impl MemoryScope {
    pub fn start(probe: Arc<dyn MemoryProbe>, interval: Duration) -> Self {
        let baseline = probe.resident_bytes().unwrap_or(0);
        let peak = Arc::new(AtomicU64::new(baseline));

        let sampler = {
            let probe = probe.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Some(bytes) = probe.resident_bytes() {
                        peak.fetch_max(bytes, Ordering::Relaxed);
                    }
                }
            })
        };

        Self {
            probe,
            baseline,
            peak,
            sampler: Some(sampler),
        }
    }

    pub fn finish(mut self) -> MemoryReading {
        self.stop_sampler();
        let final_bytes = self.probe.resident_bytes().unwrap_or(self.baseline);
        let peak_bytes = self.peak.fetch_max(final_bytes, Ordering::Relaxed).max(final_bytes);

        MemoryReading {
            baseline_bytes: self.baseline,
            peak_bytes,
            final_bytes,
        }
    }

    fn stop_sampler(&mut self) {
        if let Some(handle) = self.sampler.take() {
            handle.abort();
        }
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}
