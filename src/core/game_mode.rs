//! Game-mode state machine
//!
//! `Idle -> Detecting -> Activating -> Monitoring -> Deactivating -> Idle`
//!
//! Activation runs a fixed sequence of system-wide changes, each of which may
//! fail on its own without stopping the rest. Whatever succeeded and can be
//! undone is written to an [`OptimizationState`] owned by the returned
//! [`ActiveSession`]. Deactivation consumes the session, so the undo log is
//! replayed exactly once.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::affinity::isolated_cores;
use super::checkpoint::OptimizationState;
use super::config::GameModeConfig;
use super::group::GroupResolver;
use super::names::{ConfigurationStore, NameSets};
use super::priority::PriorityAffinityEngine;
use super::signal::{AmbientMode, ModeSignal, ModeSignalStore};
use super::standby::flush_size;
use crate::platform::{AffinityMask, Collaborators, PlatformError, ProcessSnapshot, SystemTweak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Detecting,
    Activating,
    Monitoring,
    Deactivating,
}

/// The trigger process found during detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedGame {
    pub pid: u32,
    pub name: String,
}

/// Live game-mode session. Handed back by `activate`, consumed by
/// `deactivate`.
#[derive(Debug)]
pub struct ActiveSession {
    pub game: DetectedGame,
    pub previous_mode: Option<AmbientMode>,
    pub state: OptimizationState,
}

/// What deactivation put back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeactivationReport {
    pub restored_pids: usize,
    pub shell_relaunched: bool,
    pub timer_restored: bool,
    pub qos_removed: Option<String>,
    pub services_restarted: Vec<String>,
    pub resumed_mode: Option<AmbientMode>,
}

/// `GameMode_<exe>_<unix-seconds>`
pub fn qos_policy_name(game_name: &str, unix_secs: i64) -> String {
    format!("GameMode_{}_{}", game_name, unix_secs)
}

pub struct GameModeStateMachine {
    collab: Collaborators,
    names: Arc<ConfigurationStore>,
    signal: ModeSignalStore,
    config: GameModeConfig,
    engine: PriorityAffinityEngine,
    logical_cores: usize,
    physical_cores: usize,
    own_pid: u32,
    launch_args: Vec<String>,
    phase: Phase,
}

impl GameModeStateMachine {
    pub fn new(
        collab: Collaborators,
        names: Arc<ConfigurationStore>,
        signal: ModeSignalStore,
        config: GameModeConfig,
        (logical_cores, physical_cores): (usize, usize),
    ) -> Self {
        let engine = PriorityAffinityEngine::new(collab.control.clone(), collab.processes.clone(), logical_cores);
        Self {
            collab,
            names,
            signal,
            config,
            engine,
            logical_cores,
            physical_cores,
            own_pid: std::process::id(),
            launch_args: Vec::new(),
            phase: Phase::Idle,
        }
    }

    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self.engine = self.engine.with_own_pid(pid);
        self
    }

    /// Global options handed to the resumed ambient governor, so it reads the
    /// same configuration and name-set files as this process.
    pub fn with_launch_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    // ========================================================================
    // Detecting
    // ========================================================================

    /// First running process, in pid order, whose name is a trigger.
    pub fn poll_trigger(&self) -> Option<DetectedGame> {
        let names = self.names.load();
        if names.game_triggers.is_empty() {
            return None;
        }
        let snapshot = match self.collab.processes.snapshot() {
            Ok(s) => s,
            Err(e) => {
                debug!("Process snapshot failed: {}", e);
                return None;
            }
        };
        snapshot
            .first_named_in(&names.game_triggers)
            .map(|e| DetectedGame { pid: e.pid, name: e.name.clone() })
    }

    /// Poll until a trigger appears. `None` when cancelled first.
    pub async fn detect(&mut self, token: &CancellationToken) -> Option<DetectedGame> {
        self.phase = Phase::Detecting;
        info!("Waiting for a configured game to start");
        let interval = self.config.detect_interval();
        loop {
            if let Some(game) = self.poll_trigger() {
                info!("Game detected: {} (pid {})", game.name, game.pid);
                return Some(game);
            }
            tokio::select! {
                _ = token.cancelled() => {
                    self.phase = Phase::Idle;
                    return None;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    // ========================================================================
    // Activating
    // ========================================================================

    pub fn activate(&mut self, game: DetectedGame) -> ActiveSession {
        self.phase = Phase::Activating;
        info!("Activating game mode for {}", game.name);

        let names = self.names.load();
        let previous_mode = names.enabled_ambient_mode;
        let mut state = OptimizationState::new();

        if let Err(e) = self.signal.write(&ModeSignal::game(game.pid, &game.name, previous_mode)) {
            warn!("Could not write mode signal: {}", e);
        }

        self.activate_power_plan();

        match self.collab.tuning.raise_timer_resolution() {
            Ok(()) => state.timer_resolution_changed = true,
            Err(e) => warn!("Timer resolution unchanged: {}", e),
        }

        for tweak in [
            SystemTweak::DisableCaptureOverlay,
            SystemTweak::GpuScheduling,
            SystemTweak::NetworkLatency,
        ] {
            self.tweak(tweak);
        }

        self.bias_gpu_interrupts(game.pid);

        let policy = qos_policy_name(&game.name, chrono::Utc::now().timestamp());
        match self.collab.tuning.create_qos_policy(&policy, &format!("*{}*", game.name)) {
            Ok(()) => {
                debug!("QoS policy {} created", policy);
                state.qos_policy_name = Some(policy);
            }
            Err(e) => warn!("QoS policy not created: {}", e),
        }

        state.one_way.core_parking_changed = self.tweak(SystemTweak::CoreParking);
        state.one_way.large_pages_enabled = self.tweak(SystemTweak::LargePages);
        state.one_way.mmcss_tuned = self.tweak(SystemTweak::MultimediaScheduling);

        self.flush_memory();

        let trigger_members = match self.collab.processes.snapshot() {
            Ok(snapshot) => {
                self.trim_working_sets(&snapshot, game.pid, &names);
                self.apply_priorities(&snapshot, game.pid, &names, &mut state)
            }
            Err(e) => {
                warn!("Process snapshot failed, priorities untouched: {}", e);
                BTreeSet::from([game.pid])
            }
        };

        self.kill_listed(&names, &trigger_members, &mut state);
        self.stop_listed(&names, &mut state);
        state.shell_killed = self.kill_shell();

        info!(
            "Game mode active: {} processes re-prioritized, {} closed, {} services stopped",
            state.modified_count(),
            state.killed_process_names.len(),
            state.stopped_service_names.len()
        );

        ActiveSession { game, previous_mode, state }
    }

    fn tweak(&self, tweak: SystemTweak) -> bool {
        match self.collab.tuning.apply_tweak(tweak) {
            Ok(()) => true,
            Err(e) => {
                warn!("{:?} not applied: {}", tweak, e);
                false
            }
        }
    }

    fn activate_power_plan(&self) {
        let portable = self.collab.power.battery().map(|b| b.present).unwrap_or(false);
        let plan = if portable { &self.config.laptop_plan } else { &self.config.desktop_plan };
        match self.collab.power.activate_plan(plan) {
            Ok(()) => info!("Power plan '{}' active", plan.name),
            Err(e) => warn!("Power plan '{}' not activated: {}", plan.name, e),
        }
    }

    fn bias_gpu_interrupts(&self, pid: u32) {
        let vendor = match self.collab.tuning.detect_gpu_vendor(pid) {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                debug!("GPU detection failed: {}", e);
                return;
            }
        };
        if !vendor.is_discrete() {
            debug!("{:?} GPU is integrated, interrupt policy left alone", vendor);
            return;
        }
        let cores = isolated_cores(self.logical_cores, self.physical_cores);
        let mask = (!cores.is_empty()).then(|| AffinityMask::from_cores(cores));
        if let Err(e) = self.collab.tuning.set_gpu_interrupt_policy(vendor, mask) {
            warn!("GPU interrupt policy not set: {}", e);
        }
    }

    fn flush_memory(&self) {
        let memory = match self.collab.tuning.memory_info() {
            Ok(m) => m,
            Err(e) => {
                debug!("Memory status unavailable: {}", e);
                return;
            }
        };
        let Some(bytes) = flush_size(
            memory.available_physical,
            self.config.flush_min_available_gib,
            self.config.flush_fraction,
        ) else {
            info!("Skipping memory flush, {:.1} GiB available", memory.available_gib());
            return;
        };
        if let Err(e) = self.collab.tuning.flush_standby(bytes) {
            warn!("Memory flush failed: {}", e);
        }
    }

    fn trim_working_sets(&self, snapshot: &ProcessSnapshot, game_pid: u32, names: &NameSets) {
        let mut released = 0u64;
        let mut trimmed = 0usize;
        for entry in snapshot.iter() {
            if entry.pid == game_pid || entry.pid == self.own_pid || names.is_protected(&entry.name) {
                continue;
            }
            if let Ok(bytes) = self.collab.control.trim_working_set(entry.pid) {
                released += bytes;
                trimmed += 1;
            }
        }
        debug!("Trimmed {} working sets ({} MiB)", trimmed, released >> 20);
    }

    /// Boost the trigger group and throttle everything else by name.
    /// Returns the trigger group's members.
    fn apply_priorities(
        &self,
        snapshot: &ProcessSnapshot,
        game_pid: u32,
        names: &NameSets,
        state: &mut OptimizationState,
    ) -> BTreeSet<u32> {
        let resolver = GroupResolver::new(snapshot);
        let trigger = resolver.resolve(game_pid);
        let boosted = self.engine.apply_boost(&trigger, snapshot, names, state);

        let mut throttled = 0;
        for group in resolver.partition_by_name(&trigger.members) {
            throttled += self.engine.apply_throttle(&group, snapshot, names, state).applied;
        }
        info!(
            "Boosted {} of {} game processes, throttled {} others",
            boosted.applied,
            trigger.len(),
            throttled
        );
        trigger.members
    }

    fn kill_listed(&self, names: &NameSets, spared: &BTreeSet<u32>, state: &mut OptimizationState) {
        let snapshot = match self.collab.processes.snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("Process snapshot failed, nothing closed: {}", e);
                return;
            }
        };
        for name in &names.kill_on_game_mode {
            if names.is_protected(name) {
                continue;
            }
            for pid in snapshot.pids_named(name) {
                if pid == self.own_pid || spared.contains(&pid) {
                    continue;
                }
                match self.collab.control.terminate(pid) {
                    Ok(()) => {
                        debug!("Closed {} (pid {})", name, pid);
                        state.record_killed(name);
                    }
                    Err(e) => debug!("Could not close {} (pid {}): {}", name, pid, e),
                }
            }
        }
    }

    fn stop_listed(&self, names: &NameSets, state: &mut OptimizationState) {
        for service in &names.stop_on_game_mode {
            match self.collab.services.is_running(service) {
                Ok(true) => match self.collab.services.stop(service) {
                    Ok(()) => {
                        debug!("Stopped service {}", service);
                        state.record_stopped(service);
                    }
                    Err(e) => warn!("Could not stop service {}: {}", service, e),
                },
                Ok(false) => {}
                Err(PlatformError::NotFound(_)) => {}
                Err(e) => debug!("Service {} not queried: {}", service, e),
            }
        }
    }

    fn kill_shell(&self) -> bool {
        let snapshot = match self.collab.processes.snapshot() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let mut killed = false;
        for pid in snapshot.pids_named(&self.config.shell_name) {
            match self.collab.control.terminate(pid) {
                Ok(()) => killed = true,
                Err(e) => warn!("Could not close {} (pid {}): {}", self.config.shell_name, pid, e),
            }
        }
        killed
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Block until the trigger exits or `token` is cancelled.
    ///
    /// If the process cannot be waited on, its liveness is polled every
    /// detection interval instead.
    pub async fn monitor(&mut self, pid: u32, token: &CancellationToken) {
        self.phase = Phase::Monitoring;
        info!("Monitoring pid {}", pid);
        let control = self.collab.control.clone();
        let wait = tokio::task::spawn_blocking(move || control.wait_for_exit(pid));
        tokio::select! {
            result = wait => match result {
                Ok(Ok(())) => {
                    info!("Game exited");
                    return;
                }
                Ok(Err(e)) => warn!("Cannot wait on pid {} ({}), polling instead", pid, e),
                Err(e) => warn!("Exit watcher failed ({}), polling instead", e),
            },
            _ = token.cancelled() => {
                info!("Interrupted, restoring the system");
                return;
            }
        }

        let interval = self.config.detect_interval();
        while self.collab.processes.is_alive(pid) {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Interrupted, restoring the system");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Game exited");
    }

    // ========================================================================
    // Deactivating
    // ========================================================================

    /// Undo everything the session recorded. One-way tunables stay.
    pub fn deactivate(&mut self, session: ActiveSession) -> DeactivationReport {
        self.phase = Phase::Deactivating;
        let ActiveSession { game, previous_mode, state } = session;
        info!("Restoring system after {}", game.name);

        let mut report = DeactivationReport {
            restored_pids: self.engine.restore(&state),
            ..DeactivationReport::default()
        };

        if state.shell_killed {
            match self.collab.session.relaunch_shell(&self.config.shell_name) {
                Ok(()) => report.shell_relaunched = true,
                Err(e) => warn!("Could not relaunch {}: {}", self.config.shell_name, e),
            }
        }

        if state.timer_resolution_changed {
            match self.collab.tuning.restore_timer_resolution() {
                Ok(()) => report.timer_restored = true,
                Err(e) => warn!("Timer resolution not restored: {}", e),
            }
        }

        if let Some(policy) = state.qos_policy_name.as_deref() {
            match self.collab.tuning.remove_qos_policy(policy) {
                Ok(()) => report.qos_removed = Some(policy.to_string()),
                Err(e) => warn!("QoS policy {} not removed: {}", policy, e),
            }
        }

        for service in &state.stopped_service_names {
            if matches!(self.collab.services.is_running(service), Ok(false)) {
                match self.collab.services.start(service) {
                    Ok(()) => report.services_restarted.push(service.clone()),
                    Err(e) => warn!("Could not restart service {}: {}", service, e),
                }
            }
        }

        if let Err(e) = self.signal.clear() {
            warn!("Could not clear mode signal: {}", e);
        }

        if let Some(mode) = previous_mode {
            match self.collab.session.resume_ambient(mode.as_str(), &self.launch_args) {
                Ok(()) => {
                    info!("Resumed {} mode", mode);
                    report.resumed_mode = Some(mode);
                }
                Err(e) => warn!("Could not resume {} mode: {}", mode, e),
            }
        }

        info!(
            "Game mode ended: {} processes restored, {} services restarted",
            report.restored_pids,
            report.services_restarted.len()
        );
        self.phase = Phase::Idle;
        report
    }

    /// One full cycle. `None` if cancelled before a game appeared.
    pub async fn run(&mut self, token: &CancellationToken) -> Option<DeactivationReport> {
        let game = self.detect(token).await?;
        let session = self.activate(game);
        self.monitor(session.game.pid, token).await;
        Some(self.deactivate(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{Call, FakePlatform};
    use crate::platform::{GpuVendor, IoPriority, PagePriority, PlatformResult, PriorityClass, ProcessControl};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Rig {
        fake: Arc<FakePlatform>,
        machine: GameModeStateMachine,
        signal: ModeSignalStore,
        _dir: TempDir,
    }

    #[derive(Clone, Copy)]
    enum WaitOutcome {
        Denied,
        /// Blocks, then the game exits.
        Slow(Duration),
    }

    /// Fake control whose wait on a pid does not end the workload.
    struct StubbornWait {
        fake: Arc<FakePlatform>,
        outcome: WaitOutcome,
    }

    impl ProcessControl for StubbornWait {
        fn priority(&self, pid: u32) -> PlatformResult<PriorityClass> {
            self.fake.priority(pid)
        }

        fn set_priority(&self, pid: u32, class: PriorityClass) -> PlatformResult<()> {
            self.fake.set_priority(pid, class)
        }

        fn set_io_priority(&self, pid: u32, priority: IoPriority) -> PlatformResult<()> {
            self.fake.set_io_priority(pid, priority)
        }

        fn set_page_priority(&self, pid: u32, priority: PagePriority) -> PlatformResult<()> {
            self.fake.set_page_priority(pid, priority)
        }

        fn affinity(&self, pid: u32) -> PlatformResult<AffinityMask> {
            self.fake.affinity(pid)
        }

        fn set_affinity(&self, pid: u32, mask: AffinityMask) -> PlatformResult<()> {
            self.fake.set_affinity(pid, mask)
        }

        fn terminate(&self, pid: u32) -> PlatformResult<()> {
            self.fake.terminate(pid)
        }

        fn trim_working_set(&self, pid: u32) -> PlatformResult<u64> {
            self.fake.trim_working_set(pid)
        }

        fn wait_for_exit(&self, pid: u32) -> PlatformResult<()> {
            match self.outcome {
                WaitOutcome::Denied => Err(PlatformError::PermissionDenied(format!("pid {}", pid))),
                WaitOutcome::Slow(delay) => {
                    std::thread::sleep(delay);
                    self.fake.kill(pid);
                    Ok(())
                }
            }
        }
    }

    fn rig(names_json: &str) -> Rig {
        rig_with(names_json, GameModeConfig::default(), None)
    }

    fn rig_with(names_json: &str, config: GameModeConfig, wait: Option<WaitOutcome>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let names = NameSets::from_json(names_json).unwrap();
        let signal = ModeSignalStore::new(dir.path().join(".mode_state.json"));
        let fake = FakePlatform::new();
        let mut collab = fake.collaborators();
        if let Some(outcome) = wait {
            collab.control = Arc::new(StubbornWait { fake: fake.clone(), outcome });
        }
        let machine = GameModeStateMachine::new(
            collab,
            Arc::new(ConfigurationStore::fixed(names)),
            signal.clone(),
            config,
            (8, 4),
        )
        .with_own_pid(2);
        Rig { fake, machine, signal, _dir: dir }
    }

    fn game(pid: u32, name: &str) -> DetectedGame {
        DetectedGame { pid, name: name.to_string() }
    }

    #[test]
    fn test_protected_name_survives_kill_list() {
        let mut rig = rig(r#"{"lista_blanca": ["discord.exe"], "juegos": ["game.exe"]}"#);
        rig.fake
            .add_process(100, "game.exe", None)
            .add_process(200, "discord.exe", None)
            .add_process(300, "spotify.exe", None);

        let session = rig.machine.activate(game(100, "game.exe"));

        assert!(rig.fake.process_alive(200));
        assert!(!session.state.is_modified(200));
        assert!(!session.state.killed_process_names.contains(&"discord.exe".to_string()));
        assert!(!rig.fake.process_alive(300));
        assert_eq!(session.state.killed_process_names, vec!["spotify.exe"]);
    }

    #[test]
    fn test_qos_removed_once_by_recorded_name() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake.add_process(100, "game.exe", None);

        let session = rig.machine.activate(game(100, "game.exe"));
        let recorded = session.state.qos_policy_name.clone().unwrap();
        assert!(recorded.starts_with("GameMode_game.exe_"));

        rig.fake.clear_calls();
        let report = rig.machine.deactivate(session);

        let removals: Vec<_> = rig
            .fake
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RemoveQos(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(removals, vec![recorded.clone()]);
        assert_eq!(report.qos_removed, Some(recorded));
    }

    #[test]
    fn test_failed_qos_is_not_removed() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake.add_process(100, "game.exe", None);
        rig.fake.state().fail_qos = true;

        let session = rig.machine.activate(game(100, "game.exe"));
        assert!(session.state.qos_policy_name.is_none());
        rig.machine.deactivate(session);
        assert!(!rig.fake.calls().iter().any(|c| matches!(c, Call::RemoveQos(_))));
    }

    #[test]
    fn test_only_stopped_services_restart() {
        let mut rig = rig(r#"{"juegos": ["game.exe"], "servicios_a_detener": ["mysvc"]}"#);
        rig.fake.add_process(100, "game.exe", None);
        rig.fake.add_service("spooler", true).add_service("wsearch", false).add_service("mysvc", true);

        let session = rig.machine.activate(game(100, "game.exe"));
        assert_eq!(session.state.stopped_service_names, vec!["spooler", "mysvc"]);

        // Something else already brought spooler back.
        rig.fake.state().services.insert("spooler".into(), true);
        let report = rig.machine.deactivate(session);

        assert_eq!(report.services_restarted, vec!["mysvc"]);
        assert!(!rig.fake.state().services["wsearch"]);
    }

    #[test]
    fn test_shell_and_timer_bookkeeping() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake.add_process(100, "game.exe", None).add_process(50, "explorer.exe", None);
        rig.fake.state().fail_timer = true;

        let session = rig.machine.activate(game(100, "game.exe"));
        assert!(session.state.shell_killed);
        assert!(!session.state.timer_resolution_changed);

        rig.fake.clear_calls();
        let report = rig.machine.deactivate(session);

        assert!(report.shell_relaunched);
        assert!(!report.timer_restored);
        let calls = rig.fake.calls();
        assert!(calls.contains(&Call::RelaunchShell("explorer.exe".into())));
        assert!(!calls.contains(&Call::RestoreTimer));
    }

    #[test]
    fn test_signal_lifecycle_and_resume() {
        let mut rig = rig(r#"{"juegos": ["game.exe"], "switches": {"modo_agresivo": true}}"#);
        rig.fake.add_process(100, "game.exe", None);

        let session = rig.machine.activate(game(100, "game.exe"));
        let written = rig.signal.read().unwrap();
        assert!(written.is_game());
        assert_eq!(written.game_pid, Some(100));
        assert_eq!(written.previous_mode, Some(AmbientMode::Aggressive));

        let report = rig.machine.deactivate(session);
        assert!(rig.signal.read().is_none());
        assert_eq!(report.resumed_mode, Some(AmbientMode::Aggressive));
        assert!(rig.fake.calls().contains(&Call::ResumeAmbient("aggressive".into(), Vec::new())));
        assert_eq!(rig.machine.phase(), Phase::Idle);
    }

    #[test]
    fn test_resume_forwards_launch_args() {
        let mut rig = rig(r#"{"juegos": ["game.exe"], "switches": {"modo_agresivo": true}}"#);
        rig.machine = rig
            .machine
            .with_launch_args(["--config", r"D:\gov\governor.toml", "--names", r"D:\gov\config.json"]);
        rig.fake.add_process(100, "game.exe", None);

        let session = rig.machine.activate(game(100, "game.exe"));
        rig.machine.deactivate(session);

        let resumed: Vec<_> = rig
            .fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ResumeAmbient(..)))
            .collect();
        assert_eq!(
            resumed,
            vec![Call::ResumeAmbient(
                "aggressive".into(),
                vec![
                    "--config".to_string(),
                    r"D:\gov\governor.toml".to_string(),
                    "--names".to_string(),
                    r"D:\gov\config.json".to_string(),
                ]
            )]
        );
    }

    #[test]
    fn test_priorities_split_and_restored() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake
            .add_process(100, "game.exe", None)
            .add_process(101, "crashpad.exe", Some(100))
            .add_process(300, "browser.exe", None)
            .add_process(301, "browser.exe", Some(300));

        let session = rig.machine.activate(game(100, "game.exe"));
        assert_eq!(rig.fake.priority_of(101), PriorityClass::High);
        assert_eq!(rig.fake.affinity_of(100).cores(), (1..8).collect::<Vec<_>>());
        assert_eq!(rig.fake.priority_of(301), PriorityClass::BelowNormal);
        assert_eq!(rig.fake.affinity_of(300).cores(), vec![0, 5, 6, 7]);

        let report = rig.machine.deactivate(session);
        assert_eq!(report.restored_pids, 4);
        for pid in [100, 101, 300, 301] {
            assert_eq!(rig.fake.priority_of(pid), PriorityClass::Normal);
            assert_eq!(rig.fake.affinity_of(pid), AffinityMask::all(8));
        }
    }

    #[test]
    fn test_gpu_and_flush_decisions() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake.add_process(100, "game.exe", None);
        rig.fake.state().gpu = Some(GpuVendor::Nvidia);

        let session = rig.machine.activate(game(100, "game.exe"));
        let calls = rig.fake.calls();
        assert!(calls.contains(&Call::GpuPolicy(
            GpuVendor::Nvidia,
            Some(AffinityMask::from_cores([4, 5, 6, 7]))
        )));
        assert!(calls.iter().any(|c| matches!(c, Call::FlushStandby(b) if *b > 4 << 30)));
        assert!(session.state.one_way.core_parking_changed);
        assert!(session.state.one_way.mmcss_tuned);
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        rig.fake.add_process(100, "game.exe", None).add_process(300, "other.exe", None);
        let token = CancellationToken::new();

        let report = rig.machine.run(&token).await.unwrap();

        assert_eq!(report.restored_pids, 1);
        assert_eq!(rig.fake.priority_of(300), PriorityClass::Normal);
        assert!(rig.signal.read().is_none());
        assert_eq!(rig.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_unwaitable_game_polled_until_exit() {
        let config = GameModeConfig { detect_interval_secs: 1, ..GameModeConfig::default() };
        let mut rig = rig_with(r#"{"juegos": ["game.exe"]}"#, config, Some(WaitOutcome::Denied));
        rig.fake.add_process(100, "game.exe", None).add_process(300, "other.exe", None);
        let token = CancellationToken::new();

        let fake = rig.fake.clone();
        let exit = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            fake.kill(100);
        });

        let report = tokio::time::timeout(Duration::from_secs(10), rig.machine.run(&token))
            .await
            .expect("game mode never ended")
            .unwrap();

        // Deactivation only starts once the game is gone.
        assert!(!rig.fake.process_alive(100));
        assert_eq!(report.restored_pids, 1);
        assert_eq!(rig.fake.priority_of(300), PriorityClass::Normal);
        assert!(rig.signal.read().is_none());
        assert_eq!(rig.machine.phase(), Phase::Idle);
        exit.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_polling_restores() {
        let config = GameModeConfig { detect_interval_secs: 1, ..GameModeConfig::default() };
        let mut rig = rig_with(r#"{"juegos": ["game.exe"]}"#, config, Some(WaitOutcome::Denied));
        rig.fake.add_process(100, "game.exe", None).add_process(300, "other.exe", None);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), rig.machine.run(&token))
            .await
            .expect("cancellation ignored")
            .unwrap();

        assert!(rig.fake.process_alive(100));
        assert_eq!(report.restored_pids, 2);
        assert_eq!(rig.fake.priority_of(100), PriorityClass::Normal);
        assert_eq!(rig.fake.priority_of(300), PriorityClass::Normal);
        assert!(rig.signal.read().is_none());
        assert_eq!(rig.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_during_blocking_wait_restores() {
        let mut rig = rig_with(
            r#"{"juegos": ["game.exe"]}"#,
            GameModeConfig::default(),
            Some(WaitOutcome::Slow(Duration::from_millis(500))),
        );
        rig.fake.add_process(100, "game.exe", None);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = rig.machine.run(&token).await.unwrap();

        // Restored while the game was still running.
        assert!(rig.fake.process_alive(100));
        assert_eq!(report.restored_pids, 1);
        assert_eq!(rig.fake.priority_of(100), PriorityClass::Normal);
        assert!(rig.signal.read().is_none());
        assert_eq!(rig.machine.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_detect_cancelled() {
        let mut rig = rig(r#"{"juegos": ["game.exe"]}"#);
        let token = CancellationToken::new();
        token.cancel();
        assert!(rig.machine.run(&token).await.is_none());
        assert_eq!(rig.machine.phase(), Phase::Idle);
    }
}
