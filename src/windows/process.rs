//! Process enumeration and per-process control through process handles

use std::ffi::c_void;
use std::mem::size_of;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_FAILED};
use windows::Win32::System::Memory::{SetProcessWorkingSetSizeEx, SETPROCESSWORKINGSETSIZEEX_FLAGS};
use windows::Win32::System::ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS};
use windows::Win32::System::Threading::{
    GetPriorityClass, GetProcessAffinityMask, OpenProcess, SetPriorityClass, SetProcessAffinityMask,
    TerminateProcess, WaitForSingleObject, ABOVE_NORMAL_PRIORITY_CLASS, BELOW_NORMAL_PRIORITY_CLASS,
    HIGH_PRIORITY_CLASS, IDLE_PRIORITY_CLASS, INFINITE, NORMAL_PRIORITY_CLASS, PROCESS_ACCESS_RIGHTS,
    PROCESS_CREATION_FLAGS, PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_SET_INFORMATION, PROCESS_SET_QUOTA, PROCESS_SYNCHRONIZE, PROCESS_TERMINATE,
    REALTIME_PRIORITY_CLASS,
};
use windows::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

use super::{win32_error, WindowsPlatform};
use crate::platform::{
    AffinityMask, IoPriority, PagePriority, PlatformError, PlatformResult, PriorityClass, ProcessControl,
    ProcessSnapshot, ProcessSource,
};

const PROCESS_IO_PRIORITY: u32 = 0x21;
const PROCESS_PAGE_PRIORITY: u32 = 0x27;

#[link(name = "ntdll")]
extern "system" {
    fn NtSetInformationProcess(process: HANDLE, class: u32, information: *const c_void, length: u32) -> i32;
}

/// Owned process handle, closed on drop.
struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> PlatformResult<Self> {
        unsafe {
            OpenProcess(access, false, pid)
                .map(ProcessHandle)
                .map_err(|e| win32_error(e, format!("open pid {}", pid)))
        }
    }

    fn set_information(&self, class: u32, value: u32) -> PlatformResult<()> {
        let status = unsafe {
            NtSetInformationProcess(
                self.0,
                class,
                &value as *const u32 as *const c_void,
                size_of::<u32>() as u32,
            )
        };
        if status < 0 {
            return Err(PlatformError::SystemError {
                code: status,
                message: format!("NtSetInformationProcess class {:#x}", class),
            });
        }
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn class_flags(class: PriorityClass) -> PROCESS_CREATION_FLAGS {
    match class {
        PriorityClass::Idle => IDLE_PRIORITY_CLASS,
        PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
        PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
        PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
        PriorityClass::High => HIGH_PRIORITY_CLASS,
        PriorityClass::Realtime => REALTIME_PRIORITY_CLASS,
    }
}

fn class_from_raw(raw: u32) -> Option<PriorityClass> {
    [
        PriorityClass::Idle,
        PriorityClass::BelowNormal,
        PriorityClass::Normal,
        PriorityClass::AboveNormal,
        PriorityClass::High,
        PriorityClass::Realtime,
    ]
    .into_iter()
    .find(|c| class_flags(*c).0 == raw)
}

// ============================================================================
// ProcessSource
// ============================================================================

impl ProcessSource for WindowsPlatform {
    fn snapshot(&self) -> PlatformResult<ProcessSnapshot> {
        self.source.snapshot()
    }

    fn foreground_pid(&self) -> Option<u32> {
        let mut pid = 0u32;
        unsafe {
            let hwnd = GetForegroundWindow();
            GetWindowThreadProcessId(hwnd, Some(&mut pid as *mut u32));
        }
        (pid != 0).then_some(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.source.is_alive(pid)
    }
}

// ============================================================================
// ProcessControl
// ============================================================================

impl ProcessControl for WindowsPlatform {
    fn priority(&self, pid: u32) -> PlatformResult<PriorityClass> {
        let handle = ProcessHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let raw = unsafe { GetPriorityClass(handle.0) };
        if raw == 0 {
            return Err(PlatformError::SystemError {
                code: 0,
                message: format!("GetPriorityClass failed for pid {}", pid),
            });
        }
        class_from_raw(raw).ok_or_else(|| PlatformError::InvalidArgument(format!("priority class {:#x}", raw)))
    }

    fn set_priority(&self, pid: u32, class: PriorityClass) -> PlatformResult<()> {
        let handle = ProcessHandle::open(pid, PROCESS_SET_INFORMATION)?;
        unsafe { SetPriorityClass(handle.0, class_flags(class)) }
            .map_err(|e| win32_error(e, format!("set priority of pid {}", pid)))
    }

    fn set_io_priority(&self, pid: u32, priority: IoPriority) -> PlatformResult<()> {
        let handle = ProcessHandle::open(pid, PROCESS_SET_INFORMATION)?;
        handle.set_information(PROCESS_IO_PRIORITY, priority as u32)
    }

    fn set_page_priority(&self, pid: u32, priority: PagePriority) -> PlatformResult<()> {
        let handle = ProcessHandle::open(pid, PROCESS_SET_INFORMATION)?;
        handle.set_information(PROCESS_PAGE_PRIORITY, priority as u32)
    }

    fn affinity(&self, pid: u32) -> PlatformResult<AffinityMask> {
        let handle = ProcessHandle::open(pid, PROCESS_QUERY_LIMITED_INFORMATION)?;
        let mut process_mask = 0usize;
        let mut system_mask = 0usize;
        unsafe { GetProcessAffinityMask(handle.0, &mut process_mask, &mut system_mask) }
            .map_err(|e| win32_error(e, format!("read affinity of pid {}", pid)))?;
        Ok(AffinityMask(process_mask as u64))
    }

    fn set_affinity(&self, pid: u32, mask: AffinityMask) -> PlatformResult<()> {
        if mask.is_empty() {
            return Err(PlatformError::InvalidArgument("empty affinity mask".into()));
        }
        let handle = ProcessHandle::open(pid, PROCESS_SET_INFORMATION)?;
        unsafe { SetProcessAffinityMask(handle.0, mask.bits() as usize) }
            .map_err(|e| win32_error(e, format!("set affinity of pid {}", pid)))
    }

    fn terminate(&self, pid: u32) -> PlatformResult<()> {
        let handle = ProcessHandle::open(pid, PROCESS_TERMINATE)?;
        unsafe { TerminateProcess(handle.0, 1) }.map_err(|e| win32_error(e, format!("terminate pid {}", pid)))
    }

    fn trim_working_set(&self, pid: u32) -> PlatformResult<u64> {
        let handle = ProcessHandle::open(pid, PROCESS_SET_QUOTA | PROCESS_QUERY_INFORMATION)?;
        let cb = size_of::<PROCESS_MEMORY_COUNTERS>() as u32;
        let mut counters = PROCESS_MEMORY_COUNTERS { cb, ..Default::default() };

        unsafe {
            let before = if GetProcessMemoryInfo(handle.0, &mut counters, cb).is_ok() {
                counters.WorkingSetSize
            } else {
                0
            };

            SetProcessWorkingSetSizeEx(handle.0, usize::MAX, usize::MAX, SETPROCESSWORKINGSETSIZEEX_FLAGS(0))
                .map_err(|e| win32_error(e, format!("trim pid {}", pid)))?;

            let after = if GetProcessMemoryInfo(handle.0, &mut counters, cb).is_ok() {
                counters.WorkingSetSize
            } else {
                before
            };
            Ok(before.saturating_sub(after) as u64)
        }
    }

    fn wait_for_exit(&self, pid: u32) -> PlatformResult<()> {
        let handle = ProcessHandle::open(pid, PROCESS_SYNCHRONIZE)?;
        let result = unsafe { WaitForSingleObject(handle.0, INFINITE) };
        if result == WAIT_FAILED {
            return Err(PlatformError::SystemError {
                code: result.0 as i32,
                message: format!("wait on pid {} failed", pid),
            });
        }
        Ok(())
    }
}
