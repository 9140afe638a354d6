//! Win32 backend for the collaborator traits
//!
//! ```text
//! src/windows/
//! +-- mod.rs        <- WindowsPlatform, command helper
//! +-- process.rs    <- ProcessSource / ProcessControl (process handles)
//! +-- services.rs   <- ServiceControl (service control manager)
//! +-- power.rs      <- PowerControl (battery, powercfg)
//! +-- tuning.rs     <- SystemTuning (registry, timer, QoS, GPU, memory)
//! +-- session.rs    <- SessionControl (shell relaunch, ambient resume)
//! ```

pub mod power;
pub mod process;
pub mod services;
pub mod session;
pub mod tuning;

use std::os::windows::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

use crate::platform::{Collaborators, PlatformError, PlatformResult, SysinfoProcessSource};

/// Keeps spawned helpers from flashing a console window.
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Every collaborator role backed by the live system.
pub struct WindowsPlatform {
    source: SysinfoProcessSource,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        Self { source: SysinfoProcessSource::new() }
    }

    pub fn collaborators() -> Collaborators {
        Collaborators::from_backend(Arc::new(Self::new()))
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a helper program hidden and return its stdout.
pub(crate) fn run_command(program: &str, args: &[&str]) -> PlatformResult<String> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("exit status {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        Err(PlatformError::CommandFailed {
            command: program.to_string(),
            message,
        })
    }
}

/// Run a PowerShell snippet without a profile.
pub(crate) fn powershell(script: &str) -> PlatformResult<String> {
    run_command("powershell", &["-NoProfile", "-NonInteractive", "-Command", script])
}

/// Map the calling thread's last Win32 error.
pub(crate) fn win32_error(err: windows::core::Error, context: impl Into<String>) -> PlatformError {
    let context = context.into();
    // E_ACCESSDENIED as HRESULT
    if err.code().0 as u32 == 0x8007_0005 {
        PlatformError::PermissionDenied(context)
    } else {
        PlatformError::SystemError {
            code: err.code().0,
            message: format!("{}: {}", context, err.message()),
        }
    }
}
