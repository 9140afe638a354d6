//! Standby memory reclaimer

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::StandbyConfig;
use crate::platform::{MemoryInfo, SystemTuning, TrimStep};

/// Order in which the trim tool is invoked.
pub const TRIM_SEQUENCE: [TrimStep; 4] = [
    TrimStep::WorkingSets,
    TrimStep::StandbyList,
    TrimStep::ModifiedPageList,
    TrimStep::WorkingSets,
];

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    BelowThreshold,
    Trimmed,
    /// The sequence stopped after `completed` steps
    Failed { completed: usize },
}

/// Bytes the game-mode memory flush should commit, or `None` when too little
/// memory is available to bother.
pub fn flush_size(available_bytes: u64, min_available_gib: f64, fraction: f64) -> Option<u64> {
    let available = available_bytes as f64;
    if available < min_available_gib * GIB {
        return None;
    }
    Some((available * fraction.clamp(0.0, 1.0)) as u64)
}

pub struct StandbyMemoryReclaimer {
    tuning: Arc<dyn SystemTuning>,
    config: StandbyConfig,
}

impl StandbyMemoryReclaimer {
    pub fn new(tuning: Arc<dyn SystemTuning>, config: StandbyConfig) -> Self {
        Self { tuning, config }
    }

    pub fn should_trim(&self, memory: &MemoryInfo) -> bool {
        memory.load_percent() > self.config.memory_threshold_percent
    }

    /// Run [`TRIM_SEQUENCE`], stopping at the first failing step.
    pub fn run_sequence(&self) -> ReclaimOutcome {
        for (done, step) in TRIM_SEQUENCE.iter().enumerate() {
            if let Err(e) = self.tuning.run_trim_step(&self.config.tool_path, *step) {
                warn!("Standby trim stopped at '{}': {}", step.argument(), e);
                return ReclaimOutcome::Failed { completed: done };
            }
        }
        ReclaimOutcome::Trimmed
    }

    pub fn check(&self) -> ReclaimOutcome {
        let memory = match self.tuning.memory_info() {
            Ok(m) => m,
            Err(e) => {
                debug!("Memory status unavailable: {}", e);
                return ReclaimOutcome::BelowThreshold;
            }
        };
        if !self.should_trim(&memory) {
            return ReclaimOutcome::BelowThreshold;
        }
        info!(
            "Memory load {:.0}% above {:.0}%, trimming standby memory",
            memory.load_percent(),
            self.config.memory_threshold_percent
        );
        self.run_sequence()
    }

    /// Sleep before the next check. Any trim attempt, successful or not, is
    /// followed by the full cooldown.
    pub fn next_delay(&self, outcome: ReclaimOutcome) -> Duration {
        match outcome {
            ReclaimOutcome::BelowThreshold => self.config.interval(),
            ReclaimOutcome::Trimmed | ReclaimOutcome::Failed { .. } => self.config.cooldown(),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        info!(
            "Standby reclaimer started (threshold {:.0}%)",
            self.config.memory_threshold_percent
        );
        loop {
            if token.is_cancelled() {
                break;
            }
            let outcome = self.check();
            let delay = self.next_delay(outcome);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Standby reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{Call, FakePlatform};

    fn set_load(fake: &FakePlatform, percent: u64) {
        let total = 100u64 << 20;
        fake.state().memory = MemoryInfo {
            total_physical: total,
            available_physical: total - total * percent / 100,
        };
    }

    #[test]
    fn test_below_threshold_uses_interval() {
        let fake = FakePlatform::new();
        set_load(&fake, 70);
        let reclaimer = StandbyMemoryReclaimer::new(fake.clone(), StandbyConfig::default());

        let outcome = reclaimer.check();
        assert_eq!(outcome, ReclaimOutcome::BelowThreshold);
        assert_eq!(reclaimer.next_delay(outcome), Duration::from_secs(60));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_trim_sequence_order_and_cooldown() {
        let fake = FakePlatform::new();
        set_load(&fake, 91);
        let reclaimer = StandbyMemoryReclaimer::new(fake.clone(), StandbyConfig::default());

        let outcome = reclaimer.check();
        assert_eq!(outcome, ReclaimOutcome::Trimmed);
        assert_eq!(reclaimer.next_delay(outcome), Duration::from_secs(60 * 60));
        assert_eq!(
            fake.calls(),
            TRIM_SEQUENCE.iter().map(|s| Call::TrimStep(*s)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_missing_tool_still_cools_down() {
        let fake = FakePlatform::new();
        set_load(&fake, 95);
        fake.state().fail_trim_tool = true;
        let reclaimer = StandbyMemoryReclaimer::new(fake.clone(), StandbyConfig::default());

        let outcome = reclaimer.check();
        assert_eq!(outcome, ReclaimOutcome::Failed { completed: 0 });
        assert_eq!(reclaimer.next_delay(outcome), reclaimer.next_delay(ReclaimOutcome::Trimmed));
    }

    #[test]
    fn test_flush_size() {
        let gib = 1u64 << 30;
        assert_eq!(flush_size(gib, 2.0, 0.6), None);
        assert_eq!(flush_size(10 * gib, 2.0, 0.75), Some(15 * gib / 2));
        assert_eq!(flush_size(2 * gib, 2.0, 0.5), Some(gib));
    }
}
