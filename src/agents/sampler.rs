//! Local load sampling on a worker agent.

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{CpuExt, System, SystemExt};

use super::types::LoadSnapshot;

/// Produces the load snapshot a worker attaches to its heartbeats.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSnapshot;
}

/// Samples host CPU and memory through `sysinfo` and combines them with the
/// worker's own task queue depth.
pub struct SystemLoadSampler {
    system: Mutex<System>,
    queue_depth: Arc<AtomicU32>,
}

impl SystemLoadSampler {
    pub fn new(queue_depth: Arc<AtomicU32>) -> Self {
        let mut system = System::new();
        // First CPU reading is always zero; prime it.
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            queue_depth,
        }
    }
}

impl LoadSampler for SystemLoadSampler {
    fn sample(&self) -> LoadSnapshot {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let cpu = f64::from(system.global_cpu_info().cpu_usage()) / 100.0;
        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64
        };

        LoadSnapshot::new(cpu, memory, self.queue_depth.load(Ordering::Relaxed), Utc::now())
    }
}

/// Reports a settable load. Used by tests and simulated agents.
#[derive(Debug, Default)]
pub struct FixedLoadSampler {
    load: Mutex<(f64, f64, u32)>,
}

impl FixedLoadSampler {
    pub fn new(cpu_fraction: f64, memory_fraction: f64, queue_depth: u32) -> Self {
        Self {
            load: Mutex::new((cpu_fraction, memory_fraction, queue_depth)),
        }
    }

    pub fn set(&self, cpu_fraction: f64, memory_fraction: f64, queue_depth: u32) {
        *self.load.lock().unwrap_or_else(|e| e.into_inner()) =
            (cpu_fraction, memory_fraction, queue_depth);
    }
}

impl LoadSampler for FixedLoadSampler {
    fn sample(&self) -> LoadSnapshot {
        let (cpu, memory, depth) = *self.load.lock().unwrap_or_else(|e| e.into_inner());
        LoadSnapshot::new(cpu, memory, depth, Utc::now())
    }
}
