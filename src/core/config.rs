//! Configuration for the governor loops and game mode

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::NamedPlan;

/// Directory holding `governor.toml`, `config.json` and the mode signal.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamemode-governor")
}

/// Main governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Name-set document (`lista_blanca`, `juegos`, ...)
    pub names_path: PathBuf,

    /// Cross-process mode signal
    pub signal_path: PathBuf,

    pub reaper: ReaperConfig,
    pub standby: StandbyConfig,
    pub power: PowerConfig,
    pub foreground: ForegroundConfig,
    pub game_mode: GameModeConfig,
}

/// Inactivity reaper thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,

    /// Average group CPU below this counts as idle
    pub idle_cpu_percent: f32,

    /// Continuous idle time before a group is terminated
    pub idle_minutes: u64,
}

/// Standby memory reclaimer thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandbyConfig {
    pub interval_secs: u64,

    /// Memory load (0-100) that triggers a trim
    pub memory_threshold_percent: f64,

    /// Pause after every trim attempt
    pub cooldown_minutes: u64,

    /// External trim tool
    pub tool_path: PathBuf,
}

/// Adaptive power controller timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Delay before the first evaluation
    pub settle_secs: u64,
    pub interval_secs: u64,

    /// Minimum time between two profile switches
    pub dwell_secs: u64,

    /// Battery charge at or below which battery-saver applies off mains
    pub battery_saver_percent: u8,
}

/// Foreground booster polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForegroundConfig {
    pub poll_millis: u64,
}

/// Game mode detection and activation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameModeConfig {
    pub detect_interval_secs: u64,

    /// Desktop shell killed during a session and relaunched afterwards
    pub shell_name: String,

    /// Skip the memory flush below this much available memory
    pub flush_min_available_gib: f64,

    /// Share of available memory committed by the flush
    pub flush_fraction: f64,

    pub laptop_plan: NamedPlan,
    pub desktop_plan: NamedPlan,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            names_path: dir.join("config.json"),
            signal_path: dir.join(".mode_state.json"),
            reaper: ReaperConfig::default(),
            standby: StandbyConfig::default(),
            power: PowerConfig::default(),
            foreground: ForegroundConfig::default(),
            game_mode: GameModeConfig::default(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            idle_cpu_percent: 1.0,
            idle_minutes: 60,
        }
    }
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            memory_threshold_percent: 80.0,
            cooldown_minutes: 60,
            tool_path: PathBuf::from("emptystandbylist.exe"),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            settle_secs: 10,
            interval_secs: 15,
            dwell_secs: 30,
            battery_saver_percent: 20,
        }
    }
}

impl Default for ForegroundConfig {
    fn default() -> Self {
        Self { poll_millis: 750 }
    }
}

impl Default for GameModeConfig {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            detect_interval_secs: 2,
            shell_name: "explorer.exe".into(),
            flush_min_available_gib: 2.0,
            flush_fraction: 0.6,
            laptop_plan: NamedPlan {
                name: "Gaming Performance (Laptop)".into(),
                pow_file: dir.join("gaming-laptop.pow"),
            },
            desktop_plan: NamedPlan {
                name: "Gaming Performance (Desktop)".into(),
                pow_file: dir.join("gaming-desktop.pow"),
            },
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_minutes * 60)
    }
}

impl StandbyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

impl PowerConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }
}

impl ForegroundConfig {
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_millis)
    }
}

impl GameModeConfig {
    pub fn detect_interval(&self) -> Duration {
        Duration::from_secs(self.detect_interval_secs)
    }
}

impl GovernorConfig {
    /// Load config from TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        config_dir().join("governor.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = GovernorConfig::default();
        assert_eq!(config.reaper.idle_window(), Duration::from_secs(3600));
        assert_eq!(config.reaper.interval(), Duration::from_secs(30));
        assert_eq!(config.standby.memory_threshold_percent, 80.0);
        assert_eq!(config.standby.cooldown(), Duration::from_secs(3600));
        assert_eq!(config.power.dwell(), Duration::from_secs(30));
        assert_eq!(config.power.battery_saver_percent, 20);
        assert_eq!(config.game_mode.shell_name, "explorer.exe");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("governor.toml");

        let mut config = GovernorConfig::default();
        config.reaper.idle_minutes = 15;
        config.power.dwell_secs = 45;
        config.save(&path).unwrap();

        let loaded = GovernorConfig::load(&path).unwrap();
        assert_eq!(loaded.reaper.idle_minutes, 15);
        assert_eq!(loaded.power.dwell_secs, 45);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.toml");
        std::fs::write(&path, "[standby]\nmemory_threshold_percent = 90.0\n").unwrap();

        let loaded = GovernorConfig::load(&path).unwrap();
        assert_eq!(loaded.standby.memory_threshold_percent, 90.0);
        assert_eq!(loaded.standby.interval_secs, 60);
        assert_eq!(loaded.reaper.idle_minutes, 60);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GovernorConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.foreground.poll_millis, 750);
    }
}
