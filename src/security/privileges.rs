//! Privilege checks

use tracing::info;

use crate::core::governor::GovernorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// Standard user - read-only commands only
    Standard,
    /// Elevated admin - every command
    Admin,
}

pub struct PrivilegeManager {
    level: PrivilegeLevel,
}

impl PrivilegeManager {
    pub fn new() -> Self {
        let level = if is_elevated() { PrivilegeLevel::Admin } else { PrivilegeLevel::Standard };
        info!("Running with privilege level: {:?}", level);
        Self { level }
    }

    /// Game mode and the ambient loops touch other users' processes, services
    /// and the power scheme.
    pub fn can_govern(&self) -> bool {
        self.level == PrivilegeLevel::Admin
    }

    pub fn require_elevated(&self) -> Result<(), GovernorError> {
        if self.can_govern() {
            Ok(())
        } else {
            Err(GovernorError::NotElevated)
        }
    }
}

impl Default for PrivilegeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the current process token is elevated.
pub fn is_elevated() -> bool {
    #[cfg(windows)]
    {
        use std::mem::{size_of, MaybeUninit};
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
        use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        unsafe {
            let mut token = MaybeUninit::uninit();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, token.as_mut_ptr()).is_err() {
                return false;
            }
            let token = token.assume_init();

            let mut elevation = TOKEN_ELEVATION::default();
            let mut size = 0u32;
            let result = GetTokenInformation(
                token,
                TokenElevation,
                Some(&mut elevation as *mut _ as *mut _),
                size_of::<TOKEN_ELEVATION>() as u32,
                &mut size,
            );
            let _ = CloseHandle(token);
            result.is_ok() && elevation.TokenIsElevated != 0
        }
    }
    #[cfg(not(windows))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_level_refuses() {
        let manager = PrivilegeManager { level: PrivilegeLevel::Standard };
        assert!(!manager.can_govern());
        assert!(matches!(manager.require_elevated(), Err(GovernorError::NotElevated)));

        let admin = PrivilegeManager { level: PrivilegeLevel::Admin };
        assert!(admin.require_elevated().is_ok());
    }
}
