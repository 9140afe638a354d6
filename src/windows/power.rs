//! Battery status and power scheme control

use tracing::{debug, info};
use windows::Win32::System::Power::{GetSystemPowerStatus, SYSTEM_POWER_STATUS};

use super::{run_command, win32_error, WindowsPlatform};
use crate::platform::{BatteryStatus, NamedPlan, PlatformError, PlatformResult, PowerControl, PowerSetting};

/// BatteryFlag bit reported when no system battery exists.
const NO_SYSTEM_BATTERY: u8 = 128;
/// BatteryFlag / BatteryLifePercent value for "unknown".
const UNKNOWN: u8 = 255;

/// First whitespace-separated token shaped like a GUID. powercfg output is
/// localized, so the label in front of it cannot be matched.
pub fn extract_guid(line: &str) -> Option<&str> {
    line.split_whitespace().find(|token| {
        token.len() == 36
            && token.matches('-').count() == 4
            && token.chars().all(|c| c == '-' || c.is_ascii_hexdigit())
    })
}

/// GUID of the plan in `powercfg /list` output whose line mentions `name`.
pub fn find_plan_guid<'a>(list_output: &'a str, name: &str) -> Option<&'a str> {
    let needle = name.to_lowercase();
    list_output
        .lines()
        .filter(|line| line.to_lowercase().contains(&needle))
        .find_map(extract_guid)
}

fn active_scheme() -> PlatformResult<String> {
    let output = run_command("powercfg", &["/getactivescheme"])?;
    extract_guid(&output)
        .map(str::to_string)
        .ok_or_else(|| PlatformError::NotFound("active power scheme".into()))
}

impl PowerControl for WindowsPlatform {
    fn battery(&self) -> PlatformResult<BatteryStatus> {
        let mut status = SYSTEM_POWER_STATUS::default();
        unsafe { GetSystemPowerStatus(&mut status) }.map_err(|e| win32_error(e, "power status"))?;

        if status.BatteryFlag == UNKNOWN || status.BatteryFlag & NO_SYSTEM_BATTERY != 0 {
            return Ok(BatteryStatus::absent());
        }
        let percent = if status.BatteryLifePercent == UNKNOWN {
            100
        } else {
            status.BatteryLifePercent.min(100)
        };
        Ok(BatteryStatus {
            present: true,
            percent,
            on_ac: status.ACLineStatus == 1,
        })
    }

    fn apply_settings(&self, settings: &[PowerSetting]) -> PlatformResult<()> {
        let scheme = active_scheme()?;
        for setting in settings {
            let value = setting.value.to_string();
            for verb in ["/setacvalueindex", "/setdcvalueindex"] {
                if let Err(e) = run_command("powercfg", &[verb, &scheme, setting.subgroup, setting.setting, &value]) {
                    // Hidden settings are absent on some hardware
                    debug!("Skipping power setting {}: {}", setting.key, e);
                }
            }
        }
        run_command("powercfg", &["/setactive", &scheme])?;
        Ok(())
    }

    fn activate_plan(&self, plan: &NamedPlan) -> PlatformResult<()> {
        let mut listed = run_command("powercfg", &["/list"])?;
        if find_plan_guid(&listed, &plan.name).is_none() {
            if !plan.pow_file.exists() {
                return Err(PlatformError::NotFound(plan.pow_file.display().to_string()));
            }
            let pow = plan.pow_file.to_string_lossy();
            run_command("powercfg", &["/import", &pow])?;
            info!("Imported power plan '{}'", plan.name);
            listed = run_command("powercfg", &["/list"])?;
        }

        let guid = find_plan_guid(&listed, &plan.name)
            .ok_or_else(|| PlatformError::NotFound(format!("power plan '{}'", plan.name)))?;
        run_command("powercfg", &["/setactive", guid])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = "\
Existing Power Schemes (* Active)
-----------------------------------
Power Scheme GUID: 381b4222-f694-41f0-9685-ff5bb260df2e  (Balanced) *
Power Scheme GUID: 8c5e7fda-e8bf-4a96-9a85-a6e23a8c635c  (High performance)
Power Scheme GUID: 2d1f0c3a-7b5e-4c1a-9f0e-5a6b7c8d9e0f  (Game Mode Desktop)
";

    #[test]
    fn test_find_plan_guid() {
        assert_eq!(
            find_plan_guid(LIST, "game mode desktop"),
            Some("2d1f0c3a-7b5e-4c1a-9f0e-5a6b7c8d9e0f")
        );
        assert_eq!(find_plan_guid(LIST, "Ultimate"), None);
    }

    #[test]
    fn test_extract_guid_localized() {
        let line = "GUID del plan de energía: 381b4222-f694-41f0-9685-ff5bb260df2e  (Equilibrado)";
        assert_eq!(extract_guid(line), Some("381b4222-f694-41f0-9685-ff5bb260df2e"));
        assert_eq!(extract_guid("no guid here"), None);
    }
}
