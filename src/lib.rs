//! Gamemode Governor
//!
//! A Windows resource governor that shapes scheduling around the user's
//! foreground work and, while a configured game runs, reconfigures the system
//! for it and restores it afterwards.
//!
//! ## Features
//!
//! - **Foreground booster**: the foreground process group runs at high
//!   priority on every core; everything else is pushed to the efficiency cores
//! - **Inactivity reaper**: retires process groups idle for an hour
//! - **Standby reclaimer**: trims standby memory under memory pressure
//! - **Adaptive power**: battery-aware power profiles with a dwell time
//! - **Game mode**: a detect / activate / monitor / deactivate cycle whose
//!   reversible changes are recorded and undone exactly once
//!
//! ## Safety
//!
//! - Protected names are never touched
//! - Kernel pids and the governor itself are never modified
//! - Only values that were read successfully are recorded for restore

pub mod core;
pub mod platform;
pub mod security;

#[cfg(windows)]
pub mod windows;

// Re-exports
pub use core::config::GovernorConfig;
pub use core::game_mode::{DeactivationReport, GameModeStateMachine};
pub use core::governor::{AmbientGovernor, GovernorError};
pub use core::names::{ConfigurationStore, NameSets};
pub use core::signal::{AmbientMode, ModeSignal, ModeSignalStore};
pub use platform::{core_counts, Collaborators, PlatformError, PlatformResult};
pub use security::privileges::PrivilegeManager;
