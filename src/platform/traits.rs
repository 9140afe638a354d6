//! Collaborator traits the governor drives the operating system through
//!
//! The decision logic in [`crate::core`] never calls an OS API directly. It asks
//! one of the collaborators below to do something and reads back a
//! [`PlatformResult`]. Every call is allowed to fail for a single target (the
//! process exited, access was denied, the service does not exist); callers
//! log and skip those failures instead of aborting.
//!
//! # Architecture
//!
//! ```text
//! +-------------------+
//! |   core::* logic   |  <- group resolution, undo log, loops
//! +-------------------+
//!          |
//! +-------------------+
//! | Collaborator traits|  <- This module
//! +-------------------+
//!    |            |
//! +--v-----+  +---v----+
//! | Win32  |  |  Fake  |  <- windows::WindowsPlatform / platform::fake (tests)
//! +--------+  +--------+
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for all collaborator operations.
#[derive(Debug, Clone)]
pub enum PlatformError {
    /// Permission denied (requires elevated privileges)
    PermissionDenied(String),
    /// Process, service or device not found
    NotFound(String),
    /// Operation not supported on this platform
    NotSupported(String),
    /// I/O error occurred
    IoError(String),
    /// Invalid argument provided
    InvalidArgument(String),
    /// System call failed
    SystemError { code: i32, message: String },
    /// External command exited unsuccessfully
    CommandFailed { command: String, message: String },
    /// Operation timed out
    Timeout(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            PlatformError::NotFound(msg) => write!(f, "Not found: {}", msg),
            PlatformError::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            PlatformError::IoError(msg) => write!(f, "I/O error: {}", msg),
            PlatformError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            PlatformError::SystemError { code, message } => {
                write!(f, "System error ({}): {}", code, message)
            }
            PlatformError::CommandFailed { command, message } => {
                write!(f, "Command '{}' failed: {}", command, message)
            }
            PlatformError::Timeout(msg) => write!(f, "Timeout: {}", msg),
        }
    }
}

impl std::error::Error for PlatformError {}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => PlatformError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => PlatformError::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => PlatformError::Timeout(err.to_string()),
            _ => PlatformError::IoError(err.to_string()),
        }
    }
}

/// Result type alias for collaborator operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

// ============================================================================
// Process Types
// ============================================================================

/// One row of a process snapshot. Names are stored lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub parent_pid: Option<u32>,
    /// CPU usage since the previous refresh, may exceed 100 on multi-core hosts
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
}

impl ProcessEntry {
    pub fn new(pid: u32, name: impl Into<String>, parent_pid: Option<u32>) -> Self {
        Self {
            pid,
            name: name.into().to_lowercase(),
            parent_pid,
            cpu_percent: 0.0,
            memory_bytes: 0,
        }
    }

    pub fn with_cpu(mut self, cpu_percent: f32) -> Self {
        self.cpu_percent = cpu_percent;
        self
    }
}

/// Point-in-time process list, ordered by pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    entries: Vec<ProcessEntry>,
    index: HashMap<u32, usize>,
}

impl ProcessSnapshot {
    pub fn from_entries(mut entries: Vec<ProcessEntry>) -> Self {
        entries.sort_by_key(|e| e.pid);
        entries.dedup_by_key(|e| e.pid);
        for entry in &mut entries {
            entry.name = entry.name.to_lowercase();
        }
        let index = entries.iter().enumerate().map(|(i, e)| (e.pid, i)).collect();
        Self { entries, index }
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessEntry> {
        self.index.get(&pid).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.index.contains_key(&pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pids whose name matches `name` (case-insensitive).
    pub fn pids_named(&self, name: &str) -> BTreeSet<u32> {
        let name = name.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.pid)
            .collect()
    }

    /// First process, in pid order, whose name is in `names`.
    pub fn first_named_in(&self, names: &HashSet<String>) -> Option<&ProcessEntry> {
        self.entries.iter().find(|e| names.contains(&e.name))
    }
}

/// Windows priority classes, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PriorityClass::Idle => "idle",
            PriorityClass::BelowNormal => "below-normal",
            PriorityClass::Normal => "normal",
            PriorityClass::AboveNormal => "above-normal",
            PriorityClass::High => "high",
            PriorityClass::Realtime => "realtime",
        };
        f.write_str(label)
    }
}

/// I/O priority hint as understood by the kernel (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoPriority {
    VeryLow = 0,
    Low = 1,
    Normal = 2,
    High = 3,
}

/// Page (memory) priority (1..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PagePriority {
    VeryLow = 1,
    Low = 2,
    Medium = 3,
    BelowNormal = 4,
    Normal = 5,
}

/// Bitmask of logical cores a process may run on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AffinityMask(pub u64);

impl AffinityMask {
    /// Mask covering every core in `cores`. Cores beyond 63 are ignored.
    pub fn from_cores<I: IntoIterator<Item = usize>>(cores: I) -> Self {
        let bits = cores
            .into_iter()
            .filter(|&c| c < 64)
            .fold(0u64, |acc, c| acc | (1u64 << c));
        AffinityMask(bits)
    }

    /// Mask covering cores `0..count`.
    pub fn all(count: usize) -> Self {
        Self::from_cores(0..count)
    }

    pub fn cores(&self) -> Vec<usize> {
        (0..64).filter(|c| self.0 & (1u64 << c) != 0).collect()
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffinityMask({:?})", self.cores())
    }
}

// ============================================================================
// Memory / Power Types
// ============================================================================

/// System memory status.
#[derive(Debug, Clone, Default)]
pub struct MemoryInfo {
    /// Total physical memory in bytes
    pub total_physical: u64,
    /// Available physical memory in bytes
    pub available_physical: u64,
}

impl MemoryInfo {
    pub fn used_physical(&self) -> u64 {
        self.total_physical.saturating_sub(self.available_physical)
    }

    /// Share of physical memory in use, 0.0 to 100.0.
    pub fn load_percent(&self) -> f64 {
        if self.total_physical == 0 {
            return 0.0;
        }
        self.used_physical() as f64 / self.total_physical as f64 * 100.0
    }

    pub fn available_gib(&self) -> f64 {
        self.available_physical as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Battery sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    /// A battery is installed
    pub present: bool,
    /// Charge, 0..=100
    pub percent: u8,
    /// Running on mains power
    pub on_ac: bool,
}

impl BatteryStatus {
    /// Reading reported by machines without a battery.
    pub const fn absent() -> Self {
        Self { present: false, percent: 100, on_ac: true }
    }
}

/// One power setting pushed to both AC and DC slots of the active scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSetting {
    pub key: &'static str,
    pub subgroup: &'static str,
    pub setting: &'static str,
    pub value: u32,
}

/// A power plan shipped as a `.pow` export and referenced by display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPlan {
    pub name: String,
    pub pow_file: std::path::PathBuf,
}

// ============================================================================
// Tuning Types
// ============================================================================

/// Graphics vendor driving the foreground workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
}

impl GpuVendor {
    /// Classify an adapter name by vendor keywords.
    pub fn from_adapter_name(name: &str) -> Option<Self> {
        let upper = name.to_uppercase();
        let has = |keys: &[&str]| keys.iter().any(|k| upper.contains(k));
        if has(&["NVIDIA", "RTX", "GTX", "GEFORCE"]) {
            Some(GpuVendor::Nvidia)
        } else if has(&["AMD", "RADEON", "RX"]) {
            Some(GpuVendor::Amd)
        } else if has(&["INTEL", "UHD", "IRIS"]) {
            Some(GpuVendor::Intel)
        } else {
            None
        }
    }

    /// Integrated parts share the CPU's interrupt path and are left alone.
    pub fn is_discrete(&self) -> bool {
        !matches!(self, GpuVendor::Intel)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "NVIDIA",
            GpuVendor::Amd => "AMD",
            GpuVendor::Intel => "INTEL",
        }
    }
}

/// Registry-level tweaks applied while a game runs. None are reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemTweak {
    /// Background recording and the game bar
    DisableCaptureOverlay,
    /// TDR delay and hardware-accelerated GPU scheduling
    GpuScheduling,
    /// Nagle off, network throttling index off
    NetworkLatency,
    /// Keep every core unparked
    CoreParking,
    /// Grant SeLockMemoryPrivilege and allow large pages
    LargePages,
    /// MMCSS "Games" task at high priority
    MultimediaScheduling,
}

/// Ordered sub-operations of the external standby trim tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimStep {
    WorkingSets,
    StandbyList,
    ModifiedPageList,
}

impl TrimStep {
    pub fn argument(&self) -> &'static str {
        match self {
            TrimStep::WorkingSets => "workingsets",
            TrimStep::StandbyList => "standbylist",
            TrimStep::ModifiedPageList => "modifiedpagelist",
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Process enumeration.
pub trait ProcessSource: Send + Sync {
    /// Take a fresh snapshot of every visible process.
    fn snapshot(&self) -> PlatformResult<ProcessSnapshot>;

    /// Pid owning the foreground window, if any.
    fn foreground_pid(&self) -> Option<u32>;

    fn is_alive(&self, pid: u32) -> bool;
}

/// Per-process scheduling control.
pub trait ProcessControl: Send + Sync {
    fn priority(&self, pid: u32) -> PlatformResult<PriorityClass>;
    fn set_priority(&self, pid: u32, class: PriorityClass) -> PlatformResult<()>;
    fn set_io_priority(&self, pid: u32, priority: IoPriority) -> PlatformResult<()>;
    fn set_page_priority(&self, pid: u32, priority: PagePriority) -> PlatformResult<()>;
    fn affinity(&self, pid: u32) -> PlatformResult<AffinityMask>;
    fn set_affinity(&self, pid: u32, mask: AffinityMask) -> PlatformResult<()>;

    /// Forcefully end the process.
    fn terminate(&self, pid: u32) -> PlatformResult<()>;

    /// Empty the working set; returns bytes released when known.
    fn trim_working_set(&self, pid: u32) -> PlatformResult<u64>;

    /// Block the calling thread until `pid` exits.
    fn wait_for_exit(&self, pid: u32) -> PlatformResult<()>;
}

/// Service control manager access.
pub trait ServiceControl: Send + Sync {
    fn is_running(&self, name: &str) -> PlatformResult<bool>;
    fn stop(&self, name: &str) -> PlatformResult<()>;
    fn start(&self, name: &str) -> PlatformResult<()>;
}

/// Power scheme and battery access.
pub trait PowerControl: Send + Sync {
    fn battery(&self) -> PlatformResult<BatteryStatus>;

    /// Write each setting to the AC and DC slots of the active scheme, then
    /// re-activate it.
    fn apply_settings(&self, settings: &[PowerSetting]) -> PlatformResult<()>;

    /// Import `plan` if it is not installed, then make it active.
    fn activate_plan(&self, plan: &NamedPlan) -> PlatformResult<()>;
}

/// System-wide tunables used by game mode and the reclaimer.
pub trait SystemTuning: Send + Sync {
    fn memory_info(&self) -> PlatformResult<MemoryInfo>;
    fn raise_timer_resolution(&self) -> PlatformResult<()>;
    fn restore_timer_resolution(&self) -> PlatformResult<()>;
    fn apply_tweak(&self, tweak: SystemTweak) -> PlatformResult<()>;
    fn detect_gpu_vendor(&self, pid: u32) -> PlatformResult<Option<GpuVendor>>;

    /// Raise the adapter's interrupt priority and, when given, pin its
    /// interrupts to `mask`.
    fn set_gpu_interrupt_policy(&self, vendor: GpuVendor, mask: Option<AffinityMask>) -> PlatformResult<()>;

    fn create_qos_policy(&self, name: &str, exe_pattern: &str) -> PlatformResult<()>;
    fn remove_qos_policy(&self, name: &str) -> PlatformResult<()>;

    /// Commit, touch and release `bytes` of anonymous memory.
    fn flush_standby(&self, bytes: u64) -> PlatformResult<()>;

    /// Run one step of the external standby trim tool.
    fn run_trim_step(&self, tool: &std::path::Path, step: TrimStep) -> PlatformResult<()>;
}

/// Interactive-session and launcher access.
pub trait SessionControl: Send + Sync {
    /// Start the desktop shell in the active console user's session.
    fn relaunch_shell(&self, shell: &str) -> PlatformResult<()>;

    /// Start a detached ambient governor in the given mode. `launch_args`
    /// are global options placed ahead of the subcommand.
    fn resume_ambient(&self, mode: &str, launch_args: &[String]) -> PlatformResult<()>;
}

/// Bundle of collaborators handed to every loop at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub processes: Arc<dyn ProcessSource>,
    pub control: Arc<dyn ProcessControl>,
    pub services: Arc<dyn ServiceControl>,
    pub power: Arc<dyn PowerControl>,
    pub tuning: Arc<dyn SystemTuning>,
    pub session: Arc<dyn SessionControl>,
}

impl Collaborators {
    /// Use one backend value for every collaborator role.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ProcessSource + ProcessControl + ServiceControl + PowerControl + SystemTuning + SessionControl + 'static,
    {
        Self {
            processes: backend.clone(),
            control: backend.clone(),
            services: backend.clone(),
            power: backend.clone(),
            tuning: backend.clone(),
            session: backend,
        }
    }
}
