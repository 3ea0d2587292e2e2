//! Resident-memory probe for the cycle guard.

use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Samples this process's resident set size.
pub struct MemoryProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Resident set size of this process, in bytes.
    ///
    /// Returns 0 when the platform offers no process information; callers
    /// treat that as "no memory pressure".
    pub fn rss_bytes(&self) -> u64 {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
