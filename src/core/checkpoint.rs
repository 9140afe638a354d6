//! Undo log for one game-mode session
//!
//! Only mutations that actually succeeded are written here, and for each pid
//! only the first observed original value is kept. Deactivation replays the
//! log once and discards it.

use std::collections::BTreeMap;

use crate::platform::{AffinityMask, PriorityClass};

/// A value that can be recorded once. Later writes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded<T> {
    value: Option<T>,
}

impl<T> Default for Recorded<T> {
    fn default() -> Self {
        Self { value: None }
    }
}

impl<T: Copy> Recorded<T> {
    /// Store `value` unless something was already recorded. Returns whether
    /// this call stored it.
    pub fn record(&mut self, value: T) -> bool {
        if self.value.is_some() {
            return false;
        }
        self.value = Some(value);
        true
    }

    pub fn get(&self) -> Option<T> {
        self.value
    }

    pub fn is_recorded(&self) -> bool {
        self.value.is_some()
    }
}

/// Pre-mutation values captured for one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PidOriginals {
    pub priority: Recorded<PriorityClass>,
    pub affinity: Recorded<AffinityMask>,
}

/// One-way tunables applied during activation. Tracked for reporting only,
/// never reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OneWayTunables {
    pub core_parking_changed: bool,
    pub large_pages_enabled: bool,
    pub mmcss_tuned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OptimizationState {
    originals: BTreeMap<u32, PidOriginals>,
    pub killed_process_names: Vec<String>,
    pub stopped_service_names: Vec<String>,
    pub shell_killed: bool,
    pub timer_resolution_changed: bool,
    pub qos_policy_name: Option<String>,
    pub one_way: OneWayTunables,
}

impl OptimizationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the priority `pid` had before its first successful change.
    pub fn record_priority(&mut self, pid: u32, original: PriorityClass) -> bool {
        self.originals.entry(pid).or_default().priority.record(original)
    }

    /// Record the affinity `pid` had before its first successful change.
    pub fn record_affinity(&mut self, pid: u32, original: AffinityMask) -> bool {
        self.originals.entry(pid).or_default().affinity.record(original)
    }

    pub fn original_priority(&self, pid: u32) -> Option<PriorityClass> {
        self.originals.get(&pid).and_then(|o| o.priority.get())
    }

    pub fn original_affinity(&self, pid: u32) -> Option<AffinityMask> {
        self.originals.get(&pid).and_then(|o| o.affinity.get())
    }

    /// Pids with at least one recorded original, ascending.
    pub fn modified_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.originals.keys().copied()
    }

    pub fn is_modified(&self, pid: u32) -> bool {
        self.originals.contains_key(&pid)
    }

    pub fn modified_count(&self) -> usize {
        self.originals.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, PidOriginals)> + '_ {
        self.originals.iter().map(|(&pid, &o)| (pid, o))
    }

    /// Remember a killed process name once.
    pub fn record_killed(&mut self, name: &str) {
        if !self.killed_process_names.iter().any(|n| n == name) {
            self.killed_process_names.push(name.to_string());
        }
    }

    /// Remember a stopped service name once.
    pub fn record_stopped(&mut self, name: &str) {
        if !self.stopped_service_names.iter().any(|n| n == name) {
            self.stopped_service_names.push(name.to_string());
        }
    }
}
