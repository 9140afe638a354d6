//! Process enumeration through sysinfo

use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

use super::traits::{PlatformError, PlatformResult, ProcessEntry, ProcessSnapshot};

/// Keeps one `System` alive between snapshots so per-process CPU usage is
/// measured over the interval since the previous call.
pub struct SysinfoProcessSource {
    system: Mutex<System>,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        Self { system: Mutex::new(system) }
    }

    pub fn snapshot(&self) -> PlatformResult<ProcessSnapshot> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| PlatformError::IoError("process table lock poisoned".into()))?;
        system.refresh_processes(ProcessesToUpdate::All, true);

        let entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().to_lowercase(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            })
            .collect();

        debug!("Snapshot holds {} processes", entries.len());
        Ok(ProcessSnapshot::from_entries(entries))
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        system.process(target).is_some()
    }

    pub fn memory(&self) -> (u64, u64) {
        let mut system = System::new();
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    }
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_contains_self() {
        let source = SysinfoProcessSource::new();
        let snapshot = source.snapshot().expect("snapshot");
        assert!(!snapshot.is_empty());
        assert!(snapshot.contains(std::process::id()));
        assert!(source.is_alive(std::process::id()));
    }
}
