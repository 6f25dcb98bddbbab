//! Host resource sampling.

use std::sync::{Mutex, PoisonError};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Source of CPU and memory readings.
pub trait SystemMonitor: Send + Sync {
    /// System-wide CPU load in percent, negative when unknown.
    fn cpu_load(&self) -> f64;

    /// `(cpu percent, resident bytes)` of a process.
    fn process_usage(&self, pid: u32) -> Option<(f64, u64)>;
}

/// [`SystemMonitor`] backed by `sysinfo`.
pub struct SysinfoMonitor {
    system: Mutex<System>,
}

impl SysinfoMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor for SysinfoMonitor {
    fn cpu_load(&self) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_usage();
        f64::from(system.global_cpu_usage())
    }

    fn process_usage(&self, pid: u32) -> Option<(f64, u64)> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| (f64::from(p.cpu_usage()), p.memory()))
    }
}
