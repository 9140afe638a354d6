//! Platform layer for the governor
//!
//! ```text
//! src/platform/
//! +-- mod.rs           <- This file (module definitions, re-exports)
//! +-- traits.rs        <- Collaborator traits and shared value types
//! +-- snapshot.rs      <- sysinfo-backed process enumeration
//! +-- fake.rs          <- In-memory backend (tests only)
//! ```
//!
//! The Win32 implementation of the collaborator traits lives in
//! [`crate::windows`]; everything here compiles on every target.

pub mod traits;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod fake;

pub use traits::{
    // Error types
    PlatformError,
    PlatformResult,
    // Process types
    AffinityMask,
    IoPriority,
    PagePriority,
    PriorityClass,
    ProcessEntry,
    ProcessSnapshot,
    // Memory / power types
    BatteryStatus,
    MemoryInfo,
    NamedPlan,
    PowerSetting,
    // Tuning types
    GpuVendor,
    SystemTweak,
    TrimStep,
    // Collaborators
    Collaborators,
    PowerControl,
    ProcessControl,
    ProcessSource,
    ServiceControl,
    SessionControl,
    SystemTuning,
};
pub use snapshot::SysinfoProcessSource;

/// Logical and physical core counts of this machine.
pub fn core_counts() -> (usize, usize) {
    let logical = num_cpus::get().max(1);
    let physical = num_cpus::get_physical().max(1);
    (logical, physical)
}
