//! Cross-process mode signal
//!
//! Game mode writes a small JSON document while it is active and removes it
//! on deactivation. Its presence is what keeps an ambient governor, started
//! in another process, from touching priorities at the same time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Ambient governor profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbientMode {
    Normal,
    #[serde(alias = "agresivo")]
    Aggressive,
}

impl AmbientMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmbientMode::Normal => "normal",
            AmbientMode::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for AmbientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AmbientMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(AmbientMode::Normal),
            "aggressive" | "agresivo" => Ok(AmbientMode::Aggressive),
            other => Err(format!("unknown ambient mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeState {
    Idle,
    Game,
}

/// Persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSignal {
    pub state: ModeState,
    pub game_pid: Option<u32>,
    pub game_name: Option<String>,
    pub previous_mode: Option<AmbientMode>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl ModeSignal {
    pub fn game(pid: u32, name: &str, previous_mode: Option<AmbientMode>) -> Self {
        Self {
            state: ModeState::Game,
            game_pid: Some(pid),
            game_name: Some(name.to_string()),
            previous_mode,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }

    pub fn is_game(&self) -> bool {
        self.state == ModeState::Game
    }
}

/// File-backed store for [`ModeSignal`].
#[derive(Debug, Clone)]
pub struct ModeSignalStore {
    path: PathBuf,
}

impl ModeSignalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a temporary file and rename so readers never see a torn
    /// document.
    pub fn write(&self, signal: &ModeSignal) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(signal)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Mode signal written to {}", self.path.display());
        Ok(())
    }

    /// Current signal, `None` if absent or unreadable.
    pub fn read(&self) -> Option<ModeSignal> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("Ignoring malformed mode signal {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn is_game_active(&self) -> bool {
        self.read().is_some_and(|s| s.is_game())
    }

    /// Remove the signal. A missing file is not an error.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
