//! Interactive session: shell relaunch and ambient resume

use std::ffi::c_void;
use std::os::windows::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Security::{DuplicateTokenEx, SecurityImpersonation, TokenPrimary, TOKEN_ALL_ACCESS};
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::RemoteDesktop::{WTSGetActiveConsoleSessionId, WTSQueryUserToken};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CREATE_NEW_CONSOLE, CREATE_UNICODE_ENVIRONMENT, PROCESS_INFORMATION, STARTUPINFOW,
};

use super::{win32_error, WindowsPlatform, CREATE_NO_WINDOW};
use crate::platform::{PlatformError, PlatformResult, SessionControl};

const NO_SESSION: u32 = 0xFFFF_FFFF;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn shell_path(shell: &str) -> PathBuf {
    let root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".to_string());
    PathBuf::from(root).join(shell)
}

/// Closes the wrapped token on drop.
struct Token(HANDLE);

impl Drop for Token {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Start `program` as the user logged on to the active console session.
fn spawn_as_console_user(program: &PathBuf) -> PlatformResult<()> {
    unsafe {
        let session = WTSGetActiveConsoleSessionId();
        if session == NO_SESSION {
            return Err(PlatformError::NotFound("active console session".into()));
        }

        let mut user_token = HANDLE::default();
        WTSQueryUserToken(session, &mut user_token).map_err(|e| win32_error(e, "query user token"))?;
        let user_token = Token(user_token);

        let mut primary = HANDLE::default();
        DuplicateTokenEx(
            user_token.0,
            TOKEN_ALL_ACCESS,
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut primary,
        )
        .map_err(|e| win32_error(e, "duplicate user token"))?;
        let primary = Token(primary);

        let mut environment: *mut c_void = std::ptr::null_mut();
        CreateEnvironmentBlock(&mut environment, primary.0, false)
            .map_err(|e| win32_error(e, "create environment block"))?;

        let application = wide(&program.to_string_lossy());
        let mut desktop = wide(r"winsta0\default");
        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            lpDesktop: PWSTR(desktop.as_mut_ptr()),
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        let created = CreateProcessAsUserW(
            primary.0,
            PCWSTR(application.as_ptr()),
            PWSTR::null(),
            None,
            None,
            false,
            CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_CONSOLE,
            Some(environment as *const c_void),
            PCWSTR::null(),
            &startup,
            &mut info,
        );
        let _ = DestroyEnvironmentBlock(environment as *const c_void);

        created.map_err(|e| win32_error(e, "create process as user"))?;
        let _ = CloseHandle(info.hProcess);
        let _ = CloseHandle(info.hThread);
        Ok(())
    }
}

impl SessionControl for WindowsPlatform {
    fn relaunch_shell(&self, shell: &str) -> PlatformResult<()> {
        let path = shell_path(shell);
        match spawn_as_console_user(&path) {
            Ok(()) => {
                info!("Shell relaunched in the console session");
                Ok(())
            }
            Err(e) => {
                warn!("Relaunching shell as console user failed ({}), spawning directly", e);
                Command::new(shell).spawn()?;
                Ok(())
            }
        }
    }

    fn resume_ambient(&self, mode: &str, launch_args: &[String]) -> PlatformResult<()> {
        let exe = std::env::current_exe()?;
        Command::new(exe)
            .args(launch_args)
            .args(["ambient", "--mode", mode])
            .creation_flags(CREATE_NO_WINDOW)
            .spawn()?;
        info!("Ambient governor resumed in {} mode", mode);
        Ok(())
    }
}
