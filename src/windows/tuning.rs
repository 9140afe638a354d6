//! System-wide tunables: registry, timer resolution, QoS, GPU interrupts and
//! memory pressure

use std::ffi::c_void;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::Win32::System::Memory::{VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

use super::{powershell, run_command, win32_error, WindowsPlatform};
use crate::platform::{
    AffinityMask, GpuVendor, MemoryInfo, PlatformError, PlatformResult, SystemTuning, SystemTweak, TrimStep,
};

/// 0.5 ms in 100 ns units
const TIMER_RESOLUTION_FAST: u32 = 5_000;
/// 15.6 ms, the default tick
const TIMER_RESOLUTION_DEFAULT: u32 = 156_000;

const PAGE_SIZE: usize = 4096;
const FLUSH_TOUCHES: usize = 50;
const FLUSH_HOLD: Duration = Duration::from_millis(300);

#[link(name = "ntdll")]
extern "system" {
    fn NtSetTimerResolution(desired: u32, set: u8, current: *mut u32) -> i32;
}

// ============================================================================
// Registry values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegData {
    Dword(u32),
    Qword(u64),
    Sz(&'static str),
}

impl RegData {
    fn kind(&self) -> &'static str {
        match self {
            RegData::Dword(_) => "REG_DWORD",
            RegData::Qword(_) => "REG_QWORD",
            RegData::Sz(_) => "REG_SZ",
        }
    }

    fn render(&self) -> String {
        match self {
            RegData::Dword(v) => v.to_string(),
            RegData::Qword(v) => v.to_string(),
            RegData::Sz(s) => s.to_string(),
        }
    }
}

/// One `reg add` target: key, value name, data.
pub type RegWrite = (&'static str, &'static str, RegData);

const MMCSS_GAMES: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Multimedia\SystemProfile\Tasks\Games";
const SYSTEM_PROFILE: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion\Multimedia\SystemProfile";
const CORE_PARKING: &str = r"HKLM\SYSTEM\CurrentControlSet\Control\Power\PowerSettings\54533251-82be-4824-96c1-47b60b740d00\0cc5b647-c1df-4637-891a-dec35c318583";

/// Registry writes performed for each tweak.
pub fn registry_writes(tweak: SystemTweak) -> Vec<RegWrite> {
    match tweak {
        SystemTweak::DisableCaptureOverlay => vec![
            (r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\GameDVR", "AppCaptureEnabled", RegData::Dword(0)),
            (r"HKCU\SOFTWARE\Microsoft\Windows\CurrentVersion\GameDVR", "GameDVR_Enabled", RegData::Dword(0)),
            (r"HKCU\SOFTWARE\Microsoft\GameBar", "AutoGameModeEnabled", RegData::Dword(0)),
            (r"HKCU\SOFTWARE\Microsoft\GameBar", "AllowAutoGameMode", RegData::Dword(0)),
        ],
        SystemTweak::GpuScheduling => vec![
            (r"HKLM\SYSTEM\CurrentControlSet\Control\GraphicsDrivers", "TdrDelay", RegData::Dword(60)),
            (r"HKLM\SYSTEM\CurrentControlSet\Control\GraphicsDrivers", "TdrDdiDelay", RegData::Dword(60)),
            (r"HKLM\SYSTEM\CurrentControlSet\Control\GraphicsDrivers", "HwSchMode", RegData::Dword(2)),
        ],
        SystemTweak::NetworkLatency => vec![
            (r"HKLM\SYSTEM\CurrentControlSet\Services\Tcpip\Parameters", "TcpAckFrequency", RegData::Dword(1)),
            (r"HKLM\SYSTEM\CurrentControlSet\Services\Tcpip\Parameters", "TCPNoDelay", RegData::Dword(1)),
            (r"HKLM\SYSTEM\CurrentControlSet\Services\Tcpip\Parameters", "TcpDelAckTicks", RegData::Dword(0)),
            (SYSTEM_PROFILE, "NetworkThrottlingIndex", RegData::Dword(0xFFFF_FFFF)),
            (SYSTEM_PROFILE, "SystemResponsiveness", RegData::Dword(0)),
        ],
        SystemTweak::CoreParking => vec![(CORE_PARKING, "ValueMax", RegData::Dword(0))],
        SystemTweak::LargePages => vec![(
            r"HKLM\SYSTEM\CurrentControlSet\Control\Session Manager\Memory Management",
            "LargePageMinimum",
            RegData::Dword(0),
        )],
        SystemTweak::MultimediaScheduling => vec![
            (MMCSS_GAMES, "Priority", RegData::Dword(8)),
            (MMCSS_GAMES, "GPU Priority", RegData::Dword(8)),
            (MMCSS_GAMES, "Scheduling Category", RegData::Sz("High")),
            (MMCSS_GAMES, "SFIO Priority", RegData::Sz("High")),
            (MMCSS_GAMES, "BackgroundPriority", RegData::Dword(0)),
        ],
    }
}

fn reg_add(key: &str, name: &str, data: RegData) -> PlatformResult<()> {
    let value = data.render();
    run_command("reg", &["add", key, "/v", name, "/t", data.kind(), "/d", &value, "/f"]).map(|_| ())
}

/// Perform every write, keeping the first error.
fn apply_writes(writes: &[RegWrite]) -> PlatformResult<()> {
    let mut first_error = None;
    for &(key, name, data) in writes {
        if let Err(e) = reg_add(key, name, data) {
            warn!("Registry write {}\\{} failed: {}", key, name, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Grants SeLockMemoryPrivilege to the logged-on user through secedit.
fn grant_lock_memory_privilege() -> PlatformResult<()> {
    let user = std::env::var("USERNAME").map_err(|_| PlatformError::NotFound("USERNAME".into()))?;
    let script = format!(
        r#"try {{
    $sid = (New-Object System.Security.Principal.NTAccount('{user}')).Translate([System.Security.Principal.SecurityIdentifier]).Value
    $tmp = [System.IO.Path]::GetTempFileName()
    secedit /export /cfg $tmp | Out-Null
    $cfg = Get-Content $tmp
    $line = $cfg | Where-Object {{ $_ -match 'SeLockMemoryPrivilege' }}
    if ($line -notmatch $sid) {{
        $cfg -replace '(SeLockMemoryPrivilege\s*=\s*)(.*)', "`$1`$2,*$sid" | Out-File $tmp -Encoding ascii
        secedit /configure /db secedit.sdb /cfg $tmp /areas USER_RIGHTS | Out-Null
    }}
    Remove-Item $tmp -ErrorAction SilentlyContinue
    Write-Output 'OK'
}} catch {{ Write-Output 'ERROR' }}"#
    );
    let output = powershell(&script)?;
    if output.contains("OK") {
        Ok(())
    } else {
        Err(PlatformError::CommandFailed {
            command: "secedit".into(),
            message: "SeLockMemoryPrivilege not granted".into(),
        })
    }
}

fn classify(output: &str) -> Option<GpuVendor> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(GpuVendor::from_adapter_name)
}

/// QoS policy names are generated from process names; keep quoting intact.
fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

impl SystemTuning for WindowsPlatform {
    fn memory_info(&self) -> PlatformResult<MemoryInfo> {
        let (total_physical, available_physical) = self.source.memory();
        if total_physical == 0 {
            return Err(PlatformError::NotSupported("memory status unavailable".into()));
        }
        Ok(MemoryInfo { total_physical, available_physical })
    }

    fn raise_timer_resolution(&self) -> PlatformResult<()> {
        let mut current = 0u32;
        let status = unsafe { NtSetTimerResolution(TIMER_RESOLUTION_FAST, 1, &mut current) };
        if status < 0 {
            return Err(PlatformError::SystemError { code: status, message: "NtSetTimerResolution".into() });
        }
        debug!("Timer resolution now {} x100ns", current);
        Ok(())
    }

    fn restore_timer_resolution(&self) -> PlatformResult<()> {
        let mut current = 0u32;
        let status = unsafe { NtSetTimerResolution(TIMER_RESOLUTION_DEFAULT, 0, &mut current) };
        if status < 0 {
            return Err(PlatformError::SystemError { code: status, message: "NtSetTimerResolution".into() });
        }
        Ok(())
    }

    fn apply_tweak(&self, tweak: SystemTweak) -> PlatformResult<()> {
        match tweak {
            SystemTweak::LargePages => {
                grant_lock_memory_privilege()?;
                apply_writes(&registry_writes(tweak))
            }
            SystemTweak::CoreParking => {
                // Registry write is best effort, the powercfg pair is what counts
                let _ = apply_writes(&registry_writes(tweak));
                run_command(
                    "powercfg",
                    &["/setacvalueindex", "SCHEME_CURRENT", "SUB_PROCESSOR", "CPMINCORES", "100"],
                )?;
                run_command("powercfg", &["/setactive", "SCHEME_CURRENT"])?;
                Ok(())
            }
            _ => apply_writes(&registry_writes(tweak)),
        }
    }

    fn detect_gpu_vendor(&self, pid: u32) -> PlatformResult<Option<GpuVendor>> {
        let by_engine = format!(
            r#"$c = Get-Counter "\GPU Engine(*)\Running Time" -ErrorAction SilentlyContinue
if ($c) {{ $c.CounterSamples | Where-Object {{ $_.InstanceName -match "pid_{pid}_" }} | ForEach-Object {{ $_.InstanceName }} }}"#
        );
        if let Ok(output) = powershell(&by_engine) {
            if let Some(vendor) = classify(&output) {
                return Ok(Some(vendor));
            }
        }

        let fallback = r#"Get-CimInstance -ClassName Win32_VideoController |
Where-Object { $_.AdapterDACType -ne "Internal" -or $_.AdapterRAM -gt 1GB } |
Select-Object -ExpandProperty Name -First 1"#;
        let output = powershell(fallback)?;
        Ok(classify(&output).filter(GpuVendor::is_discrete))
    }

    fn set_gpu_interrupt_policy(&self, vendor: GpuVendor, mask: Option<AffinityMask>) -> PlatformResult<()> {
        let query = format!(
            r#"Get-CimInstance -ClassName Win32_VideoController |
Where-Object {{ $_.Name -like "*{}*" -and ($_.AdapterDACType -ne "Internal" -or $_.AdapterRAM -gt 1GB) }} |
Select-Object -ExpandProperty PNPDeviceID -First 1"#,
            vendor.keyword()
        );
        let device = powershell(&query)?.trim().to_string();
        if device.is_empty() {
            return Err(PlatformError::NotFound(format!("{} adapter", vendor.keyword())));
        }

        let key = format!(
            r"HKLM\SYSTEM\CurrentControlSet\Enum\{}\Device Parameters\Interrupt Management\Affinity Policy",
            device
        );
        reg_add(&key, "DevicePolicy", RegData::Dword(4))?;
        reg_add(&key, "DevicePriority", RegData::Dword(3))?;
        if let Some(mask) = mask {
            reg_add(&key, "AssignmentSetOverride", RegData::Qword(mask.bits()))?;
        }
        info!("GPU interrupt policy set for {}", device);
        Ok(())
    }

    fn create_qos_policy(&self, name: &str, exe_pattern: &str) -> PlatformResult<()> {
        let script = format!(
            "New-NetQosPolicy -Name '{}' -AppPathNameMatchCondition '{}' -DSCPAction 46 -NetworkProfile All -Precedence 127",
            quote(name),
            quote(exe_pattern)
        );
        powershell(&script).map(|_| ())
    }

    fn remove_qos_policy(&self, name: &str) -> PlatformResult<()> {
        let script = format!("Remove-NetQosPolicy -Name '{}' -Confirm:$false", quote(name));
        powershell(&script).map(|_| ())
    }

    fn flush_standby(&self, bytes: u64) -> PlatformResult<()> {
        let size = usize::try_from(bytes).map_err(|_| PlatformError::InvalidArgument("flush size".into()))?;
        if size < PAGE_SIZE {
            return Ok(());
        }

        unsafe {
            let base = VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
            if base.is_null() {
                return Err(PlatformError::SystemError {
                    code: 0,
                    message: format!("VirtualAlloc of {} bytes failed", size),
                });
            }

            let pages = size / PAGE_SIZE;
            let step = (pages / FLUSH_TOUCHES).max(1);
            let bytes_ptr = base as *mut u8;
            for page in (0..pages).step_by(step) {
                std::ptr::write_volatile(bytes_ptr.add(page * PAGE_SIZE), 0xFF);
            }
            std::thread::sleep(FLUSH_HOLD);

            VirtualFree(base as *mut c_void, 0, MEM_RELEASE).map_err(|e| win32_error(e, "VirtualFree"))?;
        }
        Ok(())
    }

    fn run_trim_step(&self, tool: &Path, step: TrimStep) -> PlatformResult<()> {
        let program = tool.to_string_lossy();
        run_command(&program, &[step.argument()]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_writes_cover_every_tweak() {
        for tweak in [
            SystemTweak::DisableCaptureOverlay,
            SystemTweak::GpuScheduling,
            SystemTweak::NetworkLatency,
            SystemTweak::CoreParking,
            SystemTweak::LargePages,
            SystemTweak::MultimediaScheduling,
        ] {
            assert!(!registry_writes(tweak).is_empty());
        }
        let mmcss = registry_writes(SystemTweak::MultimediaScheduling);
        assert!(mmcss.contains(&(MMCSS_GAMES, "Scheduling Category", RegData::Sz("High"))));
    }

    #[test]
    fn test_classify_engine_output() {
        assert_eq!(classify("\n  NVIDIA GeForce RTX 3080\n"), Some(GpuVendor::Nvidia));
        assert_eq!(classify(""), None);
        assert_eq!(quote("it's.exe"), "it''s.exe");
    }
}
