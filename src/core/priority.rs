//! Priority and affinity engine
//!
//! Applies one of two fixed treatments ([`Policy::Boost`], [`Policy::Throttle`])
//! to every member of a process group and records what each pid looked like
//! before its first successful change. Per-pid failures are skipped; a call
//! never aborts half way.

use std::sync::Arc;
use tracing::{debug, info};

use super::affinity::Policy;
use super::checkpoint::OptimizationState;
use super::group::ProcessGroup;
use super::names::NameSets;
use crate::platform::{ProcessControl, ProcessSnapshot, ProcessSource};

/// Pids at or below this belong to the kernel (Idle, System).
pub const KERNEL_PID_CEILING: u32 = 4;

/// Outcome counts for one apply call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Pids with at least one successful change
    pub applied: usize,
    /// Protected or kernel pids, the engine itself, or pids missing from the
    /// snapshot
    pub excluded: usize,
    /// Pids every call failed for
    pub failed: usize,
}

pub struct PriorityAffinityEngine {
    control: Arc<dyn ProcessControl>,
    processes: Arc<dyn ProcessSource>,
    logical_cores: usize,
    own_pid: u32,
}

impl PriorityAffinityEngine {
    pub fn new(control: Arc<dyn ProcessControl>, processes: Arc<dyn ProcessSource>, logical_cores: usize) -> Self {
        Self {
            control,
            processes,
            logical_cores: logical_cores.max(1),
            own_pid: std::process::id(),
        }
    }

    /// Treat `pid` as the engine's own process.
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn apply_boost(
        &self,
        group: &ProcessGroup,
        snapshot: &ProcessSnapshot,
        names: &NameSets,
        state: &mut OptimizationState,
    ) -> ApplySummary {
        self.apply(Policy::Boost, group.members.iter().copied(), snapshot, names, state)
    }

    pub fn apply_throttle(
        &self,
        group: &ProcessGroup,
        snapshot: &ProcessSnapshot,
        names: &NameSets,
        state: &mut OptimizationState,
    ) -> ApplySummary {
        self.apply(Policy::Throttle, group.members.iter().copied(), snapshot, names, state)
    }

    /// Apply `policy` to each pid in `pids`.
    pub fn apply<I>(
        &self,
        policy: Policy,
        pids: I,
        snapshot: &ProcessSnapshot,
        names: &NameSets,
        state: &mut OptimizationState,
    ) -> ApplySummary
    where
        I: IntoIterator<Item = u32>,
    {
        let mask = policy.mask(self.logical_cores);
        let mut summary = ApplySummary::default();

        for pid in pids {
            let Some(entry) = snapshot.get(pid) else {
                summary.excluded += 1;
                continue;
            };
            if pid <= KERNEL_PID_CEILING || pid == self.own_pid || names.is_protected(&entry.name) {
                summary.excluded += 1;
                continue;
            }
            if self.apply_one(pid, policy, mask, state) {
                summary.applied += 1;
            } else {
                summary.failed += 1;
            }
        }

        debug!(
            "{:?}: {} applied, {} excluded, {} failed",
            policy, summary.applied, summary.excluded, summary.failed
        );
        summary
    }

    fn apply_one(
        &self,
        pid: u32,
        policy: Policy,
        mask: crate::platform::AffinityMask,
        state: &mut OptimizationState,
    ) -> bool {
        let profile = policy.profile();
        let mut changed = false;

        // A value is only changed when its original could be read first, so
        // every change stays restorable.
        match self.control.priority(pid) {
            Ok(original) => match self.control.set_priority(pid, profile.class) {
                Ok(()) => {
                    state.record_priority(pid, original);
                    changed = true;
                }
                Err(e) => debug!("pid {}: priority not set: {}", pid, e),
            },
            Err(e) => debug!("pid {}: priority unreadable: {}", pid, e),
        }

        if let Err(e) = self.control.set_io_priority(pid, profile.io) {
            debug!("pid {}: I/O priority not set: {}", pid, e);
        }
        if let Err(e) = self.control.set_page_priority(pid, profile.page) {
            debug!("pid {}: page priority not set: {}", pid, e);
        }

        match self.control.affinity(pid) {
            Ok(original) => match self.control.set_affinity(pid, mask) {
                Ok(()) => {
                    state.record_affinity(pid, original);
                    changed = true;
                }
                Err(e) => debug!("pid {}: affinity not set: {}", pid, e),
            },
            Err(e) => debug!("pid {}: affinity unreadable: {}", pid, e),
        }

        changed
    }

    /// Put every recorded pid that is still alive back to its original
    /// priority and affinity. Returns how many pids were restored.
    pub fn restore(&self, state: &OptimizationState) -> usize {
        let mut restored = 0;
        for (pid, originals) in state.entries() {
            if !self.processes.is_alive(pid) {
                continue;
            }
            let mut touched = false;
            if let Some(class) = originals.priority.get() {
                touched |= self.control.set_priority(pid, class).is_ok();
            }
            if let Some(mask) = originals.affinity.get() {
                touched |= self.control.set_affinity(pid, mask).is_ok();
            }
            if touched {
                restored += 1;
            }
        }
        info!("Restored priority/affinity on {} of {} processes", restored, state.modified_count());
        restored
    }
}
