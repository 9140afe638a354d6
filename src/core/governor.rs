//! Ambient governor
//!
//! Runs the long-lived loops side by side on one cancellation token:
//!
//! - foreground booster (priority engine in continuous mode)
//! - standby memory reclaimer
//! - adaptive power controller
//! - inactivity reaper (aggressive mode only)
//!
//! A watcher cancels the token as soon as game mode announces itself through
//! the mode signal, so the two never shape priorities at the same time.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::OptimizationState;
use super::config::GovernorConfig;
use super::group::GroupResolver;
use super::names::ConfigurationStore;
use super::power::AdaptivePowerController;
use super::priority::PriorityAffinityEngine;
use super::reaper::InactivityReaper;
use super::signal::{AmbientMode, ModeSignalStore};
use super::standby::StandbyMemoryReclaimer;
use crate::platform::{Collaborators, ProcessSource};

/// How often the ambient governor looks for a game-mode signal.
pub const SIGNAL_POLL: Duration = Duration::from_secs(1);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum GovernorError {
    /// The process lacks administrator rights
    NotElevated,
    /// A game-mode signal is present
    GameModeActive { game: Option<String> },
    Config(String),
    Io(String),
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernorError::NotElevated => write!(f, "Administrator privileges are required"),
            GovernorError::GameModeActive { game: Some(game) } => {
                write!(f, "Game mode is active for {}", game)
            }
            GovernorError::GameModeActive { game: None } => write!(f, "Game mode is active"),
            GovernorError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GovernorError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for GovernorError {}

impl From<std::io::Error> for GovernorError {
    fn from(err: std::io::Error) -> Self {
        GovernorError::Io(err.to_string())
    }
}

// ============================================================================
// Foreground booster
// ============================================================================

/// Counts from one foreground change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeSummary {
    pub boosted: usize,
    pub throttled: usize,
}

/// Boosts whatever owns the foreground window and throttles the rest,
/// re-shaping on every foreground change. Nothing is rolled back.
pub struct ForegroundBooster {
    processes: Arc<dyn ProcessSource>,
    engine: PriorityAffinityEngine,
    names: Arc<ConfigurationStore>,
    poll: Duration,
    last_foreground: Option<u32>,
}

impl ForegroundBooster {
    pub fn new(
        processes: Arc<dyn ProcessSource>,
        engine: PriorityAffinityEngine,
        names: Arc<ConfigurationStore>,
        poll: Duration,
    ) -> Self {
        Self {
            processes,
            engine,
            names,
            poll,
            last_foreground: None,
        }
    }

    /// React to a foreground reading. Shapes only when the pid changed.
    pub fn observe(&mut self, foreground: Option<u32>) -> Option<ShapeSummary> {
        let pid = foreground?;
        if self.last_foreground == Some(pid) {
            return None;
        }
        let summary = self.shape(pid)?;
        self.last_foreground = Some(pid);
        Some(summary)
    }

    /// Boost `pid`'s group, then throttle every other process by name.
    pub fn shape(&self, pid: u32) -> Option<ShapeSummary> {
        let snapshot = match self.processes.snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("Process snapshot failed: {}", e);
                return None;
            }
        };
        let names = self.names.load();
        let resolver = GroupResolver::new(&snapshot);
        let foreground = resolver.resolve(pid);

        // Ambient shaping keeps no undo log; the state is scratch space.
        let mut scratch = OptimizationState::new();
        let mut summary = ShapeSummary::default();
        let mut claimed = BTreeSet::new();

        if !names.is_protected(&foreground.name) {
            summary.boosted = self.engine.apply_boost(&foreground, &snapshot, &names, &mut scratch).applied;
            claimed = foreground.members.clone();
        }
        for group in resolver.partition_by_name(&claimed) {
            summary.throttled += self.engine.apply_throttle(&group, &snapshot, &names, &mut scratch).applied;
        }

        debug!(
            "Foreground {} ({}): {} boosted, {} throttled",
            foreground.name, pid, summary.boosted, summary.throttled
        );
        Some(summary)
    }

    pub async fn run(mut self, token: CancellationToken) {
        info!("Foreground booster started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let foreground = self.processes.foreground_pid();
            self.observe(foreground);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        info!("Foreground booster stopped");
    }
}

// ============================================================================
// Governor
// ============================================================================

pub struct AmbientGovernor {
    collab: Collaborators,
    config: GovernorConfig,
    names: Arc<ConfigurationStore>,
    signal: ModeSignalStore,
    mode: AmbientMode,
    logical_cores: usize,
}

impl AmbientGovernor {
    pub fn new(
        collab: Collaborators,
        config: GovernorConfig,
        names: Arc<ConfigurationStore>,
        mode: AmbientMode,
        logical_cores: usize,
    ) -> Self {
        let signal = ModeSignalStore::new(config.signal_path.clone());
        Self {
            collab,
            config,
            names,
            signal,
            mode,
            logical_cores,
        }
    }

    pub fn mode(&self) -> AmbientMode {
        self.mode
    }

    /// Fails while game mode holds the signal.
    pub fn check_exclusive(&self) -> Result<(), GovernorError> {
        match self.signal.read() {
            Some(signal) if signal.is_game() => Err(GovernorError::GameModeActive { game: signal.game_name }),
            _ => Ok(()),
        }
    }

    fn booster(&self) -> ForegroundBooster {
        let engine = PriorityAffinityEngine::new(
            self.collab.control.clone(),
            self.collab.processes.clone(),
            self.logical_cores,
        );
        ForegroundBooster::new(
            self.collab.processes.clone(),
            engine,
            self.names.clone(),
            self.config.foreground.poll(),
        )
    }

    /// Run until `token` is cancelled or game mode starts.
    pub async fn run(self, token: CancellationToken) -> Result<(), GovernorError> {
        self.check_exclusive()?;
        info!("Ambient governor starting in {} mode", self.mode);

        let mut tasks = JoinSet::new();
        tasks.spawn(watch_signal(self.signal.clone(), token.clone()));
        tasks.spawn(self.booster().run(token.clone()));
        tasks.spawn(
            StandbyMemoryReclaimer::new(self.collab.tuning.clone(), self.config.standby.clone())
                .run(token.clone()),
        );
        tasks.spawn(
            AdaptivePowerController::new(self.collab.power.clone(), self.config.power.clone())
                .run(token.clone()),
        );
        if self.mode == AmbientMode::Aggressive {
            tasks.spawn(
                InactivityReaper::new(
                    self.collab.processes.clone(),
                    self.collab.control.clone(),
                    self.names.clone(),
                    self.config.reaper.clone(),
                )
                .run(token.clone()),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Governor task ended abnormally: {}", e);
                token.cancel();
            }
        }
        info!("Ambient governor stopped");
        Ok(())
    }
}

/// Cancel `token` once a game-mode signal appears.
async fn watch_signal(signal: ModeSignalStore, token: CancellationToken) {
    loop {
        if signal.is_game_active() {
            info!("Game mode signalled, shutting down ambient loops");
            token.cancel();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(SIGNAL_POLL) => {}
        }
    }
}
