//! Inactivity reaper
//!
//! Processes are bucketed by executable name. A bucket whose average CPU
//! stays under the idle threshold for the whole idle window is terminated in
//! one pass. A single busy sample resets its timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::ReaperConfig;
use super::group::{GroupResolver, ProcessGroup};
use super::names::{ConfigurationStore, NameSets};
use crate::platform::{ProcessControl, ProcessSnapshot, ProcessSource};

/// When a bucket was first seen idle, keyed by its representative pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InactivityTimer {
    pub pid: u32,
    pub first_idle_observed_at: Instant,
}

/// A bucket that has been idle long enough to close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retirement {
    pub name: String,
    pub pids: Vec<u32>,
}

pub struct InactivityReaper {
    processes: Arc<dyn ProcessSource>,
    control: Arc<dyn ProcessControl>,
    names: Arc<ConfigurationStore>,
    config: ReaperConfig,
    own_pid: u32,
    timers: HashMap<u32, InactivityTimer>,
}

impl InactivityReaper {
    pub fn new(
        processes: Arc<dyn ProcessSource>,
        control: Arc<dyn ProcessControl>,
        names: Arc<ConfigurationStore>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            processes,
            control,
            names,
            config,
            own_pid: std::process::id(),
            timers: HashMap::new(),
        }
    }

    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    pub fn timers(&self) -> impl Iterator<Item = &InactivityTimer> {
        self.timers.values()
    }

    pub fn timer_for(&self, representative_pid: u32) -> Option<&InactivityTimer> {
        self.timers.get(&representative_pid)
    }

    /// Update idle timers from one snapshot and return the buckets due for
    /// termination. Timers of returned buckets are cleared.
    pub fn evaluate(
        &mut self,
        snapshot: &ProcessSnapshot,
        foreground: Option<&ProcessGroup>,
        names: &NameSets,
        now: Instant,
    ) -> Vec<Retirement> {
        self.timers.retain(|pid, _| snapshot.contains(*pid));

        let window = self.config.idle_window();
        let threshold = self.config.idle_cpu_percent;
        let mut due = Vec::new();

        for (name, pids) in GroupResolver::new(snapshot).by_name() {
            let exempt = names.inactivity_immune.contains(&name)
                || names.is_protected(&name)
                || pids.iter().any(|&pid| pid == self.own_pid)
                || foreground.is_some_and(|g| pids.iter().any(|&pid| g.contains(pid)));
            if exempt {
                for pid in &pids {
                    self.timers.remove(pid);
                }
                continue;
            }

            let total: f32 = pids
                .iter()
                .filter_map(|&pid| snapshot.get(pid))
                .map(|e| e.cpu_percent)
                .sum();
            let average = total / pids.len() as f32;
            let representative = pids[0];

            if average >= threshold {
                self.timers.remove(&representative);
                continue;
            }

            let timer = *self.timers.entry(representative).or_insert(InactivityTimer {
                pid: representative,
                first_idle_observed_at: now,
            });
            if now.saturating_duration_since(timer.first_idle_observed_at) > window {
                self.timers.remove(&representative);
                due.push(Retirement { name, pids });
            }
        }

        due
    }

    /// Terminate every pid of `retirement`. Returns how many were ended.
    pub fn retire(&self, retirement: &Retirement) -> usize {
        let ended = retirement
            .pids
            .iter()
            .filter(|&&pid| match self.control.terminate(pid) {
                Ok(()) => true,
                Err(e) => {
                    debug!("pid {}: terminate failed: {}", pid, e);
                    false
                }
            })
            .count();
        info!(
            "Closed idle '{}' ({} of {} instances)",
            retirement.name,
            ended,
            retirement.pids.len()
        );
        ended
    }

    /// One iteration: snapshot, evaluate, terminate.
    pub fn tick(&mut self, now: Instant) -> usize {
        let snapshot = match self.processes.snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("Process snapshot failed: {}", e);
                return 0;
            }
        };
        let foreground = self
            .processes
            .foreground_pid()
            .map(|pid| GroupResolver::new(&snapshot).resolve(pid));
        let names = self.names.load();

        let due = self.evaluate(&snapshot, foreground.as_ref(), &names, now);
        due.iter().map(|r| self.retire(r)).sum()
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Inactivity reaper started (below {:.1}% for {} min)",
            self.config.idle_cpu_percent, self.config.idle_minutes
        );
        let interval = self.config.interval();
        loop {
            if token.is_cancelled() {
                break;
            }
            self.tick(Instant::now());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Inactivity reaper stopped");
    }
}
