//! Platform-independent governor logic

pub mod affinity;
pub mod checkpoint;
pub mod config;
pub mod game_mode;
pub mod governor;
pub mod group;
pub mod names;
pub mod power;
pub mod priority;
pub mod reaper;
pub mod signal;
pub mod standby;
