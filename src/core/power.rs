//! Adaptive power controller
//!
//! Picks one of three power profiles from the battery state and pushes its
//! setting table into the active scheme. Switches are rate limited by a dwell
//! time so a battery reading hovering around the threshold cannot make the
//! scheme flap.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::PowerConfig;
use crate::platform::{BatteryStatus, PowerControl, PowerSetting};

const SUB_PROCESSOR: &str = "54533251-82be-4824-96c1-47b60b740d00";
const SUB_DISK: &str = "0012ee47-9041-4b5d-9b77-535fba8b1442";
const SUB_USB: &str = "2a737441-1930-4402-8d77-b2bebba308a3";
const SUB_PCIE: &str = "501a4d13-42af-4429-9fd1-a8218c268e20";
const SUB_VIDEO: &str = "7516b95f-f776-4464-8c53-06167f40cc99";

/// key, subgroup, setting, values for (adaptive, battery saver, portable)
const SETTING_TABLE: [(&str, &str, &str, [u32; 3]); 12] = [
    ("cpu_min", SUB_PROCESSOR, "bc5038f7-23e0-4960-96da-33abaf5935ec", [5, 0, 5]),
    ("cpu_max", SUB_PROCESSOR, "bc5038f7-23e0-4960-96da-33abaf5935ed", [95, 50, 90]),
    ("latency_sensitivity", SUB_PROCESSOR, "5d76a2ca-e8c0-402f-a133-2158492d58ad", [0, 1, 0]),
    ("boost_mode", SUB_PROCESSOR, "be337238-0d82-4146-a960-4f3749d470c7", [2, 0, 2]),
    ("cooling_policy", SUB_PROCESSOR, "94d3a615-a899-4ac5-ae2b-e4d8f634367f", [1, 0, 1]),
    ("cpu_power_saving", SUB_PROCESSOR, "68dd2f27-a4ce-4e11-8487-3794e4135dfa", [50, 100, 60]),
    ("disk_timeout", SUB_DISK, "6738e2c4-e8a5-4a42-b16a-e040e769756e", [0, 300, 600]),
    ("usb_selective_suspend", SUB_USB, "48e6b7a6-50f5-4782-a5d4-53bb8f07e226", [0, 1, 0]),
    ("pcie_link_state", SUB_PCIE, "ee12f906-d277-404b-b6da-e5fa1a576df5", [0, 3, 1]),
    ("display_timeout", SUB_VIDEO, "3c0bc021-c8a8-4e07-a973-6b14cbcb2b7e", [600, 120, 300]),
    ("adaptive_brightness", SUB_VIDEO, "fbd9aa66-9553-4097-ba44-ed6e9d65eab8", [1, 1, 1]),
    ("brightness", SUB_VIDEO, "aded5e82-b909-4619-9949-f5d71dac0bcb", [80, 40, 70]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerProfile {
    AdaptiveEfficiency,
    BatterySaver,
    PortableEfficiency,
}

impl PowerProfile {
    pub fn name(&self) -> &'static str {
        match self {
            PowerProfile::AdaptiveEfficiency => "adaptive-efficiency",
            PowerProfile::BatterySaver => "battery-saver",
            PowerProfile::PortableEfficiency => "portable-efficiency",
        }
    }

    fn column(&self) -> usize {
        match self {
            PowerProfile::AdaptiveEfficiency => 0,
            PowerProfile::BatterySaver => 1,
            PowerProfile::PortableEfficiency => 2,
        }
    }

    /// Setting values for this profile.
    pub fn settings(&self) -> Vec<PowerSetting> {
        SETTING_TABLE
            .iter()
            .map(|&(key, subgroup, setting, values)| PowerSetting {
                key,
                subgroup,
                setting,
                value: values[self.column()],
            })
            .collect()
    }

    /// Profile wanted for a battery reading.
    pub fn select(battery: &BatteryStatus, portable: bool, saver_percent: u8) -> Self {
        if !portable {
            return PowerProfile::AdaptiveEfficiency;
        }
        if battery.percent <= saver_percent && !battery.on_ac {
            PowerProfile::BatterySaver
        } else {
            PowerProfile::PortableEfficiency
        }
    }
}

impl fmt::Display for PowerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owned by the controller and mutated only after a successful apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerProfileState {
    pub current: Option<PowerProfile>,
    pub last_switch: Option<Instant>,
}

pub struct AdaptivePowerController {
    power: Arc<dyn PowerControl>,
    config: PowerConfig,
    portable: Option<bool>,
    state: PowerProfileState,
}

impl AdaptivePowerController {
    pub fn new(power: Arc<dyn PowerControl>, config: PowerConfig) -> Self {
        Self {
            power,
            config,
            portable: None,
            state: PowerProfileState::default(),
        }
    }

    /// Fix the machine class instead of probing the battery sensor.
    pub fn with_portable(mut self, portable: bool) -> Self {
        self.portable = Some(portable);
        self
    }

    pub fn state(&self) -> PowerProfileState {
        self.state
    }

    /// Machine class, detected once on first use.
    pub fn portable(&mut self) -> bool {
        if let Some(p) = self.portable {
            return p;
        }
        let portable = self.power.battery().map(|b| b.present).unwrap_or(false);
        info!("Machine class: {}", if portable { "portable" } else { "desktop" });
        self.portable = Some(portable);
        portable
    }

    /// Profile to switch to now, if any. The first evaluation always
    /// answers; later ones require a different profile and an elapsed dwell.
    pub fn evaluate(&self, battery: &BatteryStatus, portable: bool, now: Instant) -> Option<PowerProfile> {
        let wanted = PowerProfile::select(battery, portable, self.config.battery_saver_percent);
        match (self.state.current, self.state.last_switch) {
            (None, _) => Some(wanted),
            (Some(current), _) if current == wanted => None,
            (Some(_), Some(last)) if now.saturating_duration_since(last) < self.config.dwell() => {
                debug!("Holding power profile, dwell not elapsed");
                None
            }
            _ => Some(wanted),
        }
    }

    /// Push `profile` into the active scheme and record the switch.
    pub fn apply(&mut self, profile: PowerProfile, now: Instant) -> bool {
        match self.power.apply_settings(&profile.settings()) {
            Ok(()) => {
                info!("Power profile: {}", profile);
                self.state = PowerProfileState {
                    current: Some(profile),
                    last_switch: Some(now),
                };
                true
            }
            Err(e) => {
                warn!("Failed to apply power profile {}: {}", profile, e);
                false
            }
        }
    }

    /// One iteration. Returns the profile applied, if any.
    pub fn step(&mut self, now: Instant) -> Option<PowerProfile> {
        let portable = self.portable();
        let battery = match self.power.battery() {
            Ok(b) => b,
            Err(e) => {
                debug!("Battery status unavailable: {}", e);
                BatteryStatus::absent()
            }
        };
        let profile = self.evaluate(&battery, portable, now)?;
        self.apply(profile, now).then_some(profile)
    }

    pub async fn run(mut self, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.settle()) => {}
        }
        info!("Adaptive power controller started");
        let interval = self.config.interval();
        loop {
            if token.is_cancelled() {
                break;
            }
            self.step(Instant::now());
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Adaptive power controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::{Call, FakePlatform};
    use std::time::Duration;

    fn on_battery(percent: u8) -> BatteryStatus {
        BatteryStatus { present: true, percent, on_ac: false }
    }

    fn controller(fake: &Arc<FakePlatform>, portable: bool) -> AdaptivePowerController {
        AdaptivePowerController::new(fake.clone(), PowerConfig::default()).with_portable(portable)
    }

    #[test]
    fn test_select() {
        assert_eq!(PowerProfile::select(&on_battery(20), true, 20), PowerProfile::BatterySaver);
        assert_eq!(PowerProfile::select(&on_battery(21), true, 20), PowerProfile::PortableEfficiency);
        let charging = BatteryStatus { present: true, percent: 5, on_ac: true };
        assert_eq!(PowerProfile::select(&charging, true, 20), PowerProfile::PortableEfficiency);
        assert_eq!(PowerProfile::select(&on_battery(5), false, 20), PowerProfile::AdaptiveEfficiency);
    }

    #[test]
    fn test_settings_table_columns() {
        let saver = PowerProfile::BatterySaver.settings();
        assert_eq!(saver.len(), 12);
        let cpu_max = saver.iter().find(|s| s.key == "cpu_max").unwrap();
        assert_eq!(cpu_max.value, 50);
        assert_eq!(cpu_max.subgroup, SUB_PROCESSOR);

        let adaptive = PowerProfile::AdaptiveEfficiency.settings();
        assert_eq!(adaptive.iter().find(|s| s.key == "display_timeout").unwrap().value, 600);
    }

    #[test]
    fn test_first_apply_then_dwell() {
        let fake = FakePlatform::new();
        let mut ctl = controller(&fake, true);
        let t0 = Instant::now();

        fake.state().battery = on_battery(80);
        assert_eq!(ctl.step(t0), Some(PowerProfile::PortableEfficiency));

        fake.state().battery = on_battery(10);
        assert_eq!(ctl.step(t0 + Duration::from_secs(15)), None);
        assert_eq!(ctl.step(t0 + Duration::from_secs(30)), Some(PowerProfile::BatterySaver));
        assert_eq!(ctl.step(t0 + Duration::from_secs(45)), None);

        let applies = fake
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ApplySettings(_)))
            .count();
        assert_eq!(applies, 2);
    }

    #[test]
    fn test_switches_never_closer_than_dwell() {
        let fake = FakePlatform::new();
        let mut ctl = controller(&fake, true);
        let t0 = Instant::now();
        let dwell = PowerConfig::default().dwell();
        let mut switches = Vec::new();

        // Noisy readings around the threshold, sampled every 5 s
        for i in 0..120u64 {
            let percent = if i % 3 == 0 { 19 } else { 21 };
            let now = t0 + Duration::from_secs(i * 5);
            let reading = on_battery(percent);
            if let Some(profile) = ctl.evaluate(&reading, true, now) {
                assert!(ctl.apply(profile, now));
                switches.push(now);
            }
        }

        assert!(switches.len() > 2);
        for pair in switches.windows(2) {
            assert!(pair[1] - pair[0] >= dwell);
        }
    }

    #[test]
    fn test_desktop_stays_adaptive() {
        let fake = FakePlatform::new();
        let mut ctl = controller(&fake, false);
        let t0 = Instant::now();
        assert_eq!(ctl.step(t0), Some(PowerProfile::AdaptiveEfficiency));
        assert_eq!(ctl.step(t0 + Duration::from_secs(600)), None);
        assert_eq!(ctl.state().current, Some(PowerProfile::AdaptiveEfficiency));
    }

    #[test]
    fn test_portable_detected_from_battery() {
        let fake = FakePlatform::new();
        fake.state().battery = on_battery(50);
        let mut ctl = AdaptivePowerController::new(fake.clone(), PowerConfig::default());
        assert!(ctl.portable());
    }
}
