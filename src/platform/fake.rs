//! In-memory backend used by unit tests
//!
//! Implements every collaborator trait over a small mutable process and
//! service table and records each mutating call in order.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::*;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetPriority(u32, PriorityClass),
    SetIoPriority(u32, IoPriority),
    SetPagePriority(u32, PagePriority),
    SetAffinity(u32, AffinityMask),
    Terminate(u32),
    TrimWorkingSet(u32),
    StopService(String),
    StartService(String),
    ApplySettings(Vec<(&'static str, u32)>),
    ActivatePlan(String),
    RaiseTimer,
    RestoreTimer,
    Tweak(SystemTweak),
    GpuPolicy(GpuVendor, Option<AffinityMask>),
    CreateQos(String, String),
    RemoveQos(String),
    FlushStandby(u64),
    TrimStep(TrimStep),
    RelaunchShell(String),
    ResumeAmbient(String, Vec<String>),
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub name: String,
    pub parent: Option<u32>,
    pub cpu: f32,
    pub priority: PriorityClass,
    pub affinity: AffinityMask,
    pub alive: bool,
}

#[derive(Debug)]
pub struct FakeState {
    pub processes: BTreeMap<u32, FakeProcess>,
    pub foreground: Option<u32>,
    pub services: BTreeMap<String, bool>,
    pub battery: BatteryStatus,
    pub memory: MemoryInfo,
    pub gpu: Option<GpuVendor>,
    /// Pids whose mutating calls fail with access denied
    pub denied: HashSet<u32>,
    pub fail_snapshot: bool,
    pub fail_timer: bool,
    pub fail_qos: bool,
    pub fail_trim_tool: bool,
    pub calls: Vec<Call>,
}

pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                processes: BTreeMap::new(),
                foreground: None,
                services: BTreeMap::new(),
                battery: BatteryStatus::absent(),
                memory: MemoryInfo {
                    total_physical: 16 << 30,
                    available_physical: 8 << 30,
                },
                gpu: None,
                denied: HashSet::new(),
                fail_snapshot: false,
                fail_timer: false,
                fail_qos: false,
                fail_trim_tool: false,
                calls: Vec::new(),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    pub fn add_process(&self, pid: u32, name: &str, parent: Option<u32>) -> &Self {
        self.state().processes.insert(
            pid,
            FakeProcess {
                name: name.to_lowercase(),
                parent,
                cpu: 0.0,
                priority: PriorityClass::Normal,
                affinity: AffinityMask::all(8),
                alive: true,
            },
        );
        self
    }

    pub fn add_service(&self, name: &str, running: bool) -> &Self {
        self.state().services.insert(name.to_lowercase(), running);
        self
    }

    pub fn deny(&self, pid: u32) {
        self.state().denied.insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        if let Some(p) = self.state().processes.get_mut(&pid) {
            p.alive = false;
        }
    }

    pub fn priority_of(&self, pid: u32) -> PriorityClass {
        self.state().processes[&pid].priority
    }

    pub fn affinity_of(&self, pid: u32) -> AffinityMask {
        self.state().processes[&pid].affinity
    }

    pub fn process_alive(&self, pid: u32) -> bool {
        self.state().processes.get(&pid).map(|p| p.alive).unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::from_backend(self.clone())
    }

    fn mutate<F>(&self, pid: u32, call: Call, f: F) -> PlatformResult<()>
    where
        F: FnOnce(&mut FakeProcess),
    {
        let mut state = self.state();
        if state.denied.contains(&pid) {
            return Err(PlatformError::PermissionDenied(format!("pid {}", pid)));
        }
        let process = state
            .processes
            .get_mut(&pid)
            .filter(|p| p.alive)
            .ok_or_else(|| PlatformError::NotFound(format!("pid {}", pid)))?;
        f(process);
        state.calls.push(call);
        Ok(())
    }

    fn read<T, F>(&self, pid: u32, f: F) -> PlatformResult<T>
    where
        F: FnOnce(&FakeProcess) -> T,
    {
        let state = self.state();
        state
            .processes
            .get(&pid)
            .filter(|p| p.alive)
            .map(f)
            .ok_or_else(|| PlatformError::NotFound(format!("pid {}", pid)))
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl ProcessSource for FakePlatform {
    fn snapshot(&self) -> PlatformResult<ProcessSnapshot> {
        let state = self.state();
        if state.fail_snapshot {
            return Err(PlatformError::SystemError { code: -1, message: "snapshot".into() });
        }
        let entries = state
            .processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(&pid, p)| ProcessEntry::new(pid, p.name.clone(), p.parent).with_cpu(p.cpu))
            .collect();
        Ok(ProcessSnapshot::from_entries(entries))
    }

    fn foreground_pid(&self) -> Option<u32> {
        self.state().foreground
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.process_alive(pid)
    }
}

impl ProcessControl for FakePlatform {
    fn priority(&self, pid: u32) -> PlatformResult<PriorityClass> {
        self.read(pid, |p| p.priority)
    }

    fn set_priority(&self, pid: u32, class: PriorityClass) -> PlatformResult<()> {
        self.mutate(pid, Call::SetPriority(pid, class), |p| p.priority = class)
    }

    fn set_io_priority(&self, pid: u32, priority: IoPriority) -> PlatformResult<()> {
        self.mutate(pid, Call::SetIoPriority(pid, priority), |_| {})
    }

    fn set_page_priority(&self, pid: u32, priority: PagePriority) -> PlatformResult<()> {
        self.mutate(pid, Call::SetPagePriority(pid, priority), |_| {})
    }

    fn affinity(&self, pid: u32) -> PlatformResult<AffinityMask> {
        self.read(pid, |p| p.affinity)
    }

    fn set_affinity(&self, pid: u32, mask: AffinityMask) -> PlatformResult<()> {
        self.mutate(pid, Call::SetAffinity(pid, mask), |p| p.affinity = mask)
    }

    fn terminate(&self, pid: u32) -> PlatformResult<()> {
        self.mutate(pid, Call::Terminate(pid), |p| p.alive = false)
    }

    fn trim_working_set(&self, pid: u32) -> PlatformResult<u64> {
        self.mutate(pid, Call::TrimWorkingSet(pid), |_| {}).map(|_| 0)
    }

    fn wait_for_exit(&self, pid: u32) -> PlatformResult<()> {
        // The workload "ends" as soon as someone waits on it.
        self.kill(pid);
        Ok(())
    }
}

impl ServiceControl for FakePlatform {
    fn is_running(&self, name: &str) -> PlatformResult<bool> {
        self.state()
            .services
            .get(&name.to_lowercase())
            .copied()
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))
    }

    fn stop(&self, name: &str) -> PlatformResult<()> {
        let mut state = self.state();
        let running = state
            .services
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))?;
        *running = false;
        state.calls.push(Call::StopService(name.to_lowercase()));
        Ok(())
    }

    fn start(&self, name: &str) -> PlatformResult<()> {
        let mut state = self.state();
        let running = state
            .services
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))?;
        *running = true;
        state.calls.push(Call::StartService(name.to_lowercase()));
        Ok(())
    }
}

impl PowerControl for FakePlatform {
    fn battery(&self) -> PlatformResult<BatteryStatus> {
        Ok(self.state().battery)
    }

    fn apply_settings(&self, settings: &[PowerSetting]) -> PlatformResult<()> {
        self.record(Call::ApplySettings(settings.iter().map(|s| (s.key, s.value)).collect()));
        Ok(())
    }

    fn activate_plan(&self, plan: &NamedPlan) -> PlatformResult<()> {
        self.record(Call::ActivatePlan(plan.name.clone()));
        Ok(())
    }
}

impl SystemTuning for FakePlatform {
    fn memory_info(&self) -> PlatformResult<MemoryInfo> {
        Ok(self.state().memory.clone())
    }

    fn raise_timer_resolution(&self) -> PlatformResult<()> {
        if self.state().fail_timer {
            return Err(PlatformError::SystemError { code: -1, message: "timer".into() });
        }
        self.record(Call::RaiseTimer);
        Ok(())
    }

    fn restore_timer_resolution(&self) -> PlatformResult<()> {
        self.record(Call::RestoreTimer);
        Ok(())
    }

    fn apply_tweak(&self, tweak: SystemTweak) -> PlatformResult<()> {
        self.record(Call::Tweak(tweak));
        Ok(())
    }

    fn detect_gpu_vendor(&self, _pid: u32) -> PlatformResult<Option<GpuVendor>> {
        Ok(self.state().gpu)
    }

    fn set_gpu_interrupt_policy(&self, vendor: GpuVendor, mask: Option<AffinityMask>) -> PlatformResult<()> {
        self.record(Call::GpuPolicy(vendor, mask));
        Ok(())
    }

    fn create_qos_policy(&self, name: &str, exe_pattern: &str) -> PlatformResult<()> {
        if self.state().fail_qos {
            return Err(PlatformError::CommandFailed {
                command: "New-NetQosPolicy".into(),
                message: "denied".into(),
            });
        }
        self.record(Call::CreateQos(name.to_string(), exe_pattern.to_string()));
        Ok(())
    }

    fn remove_qos_policy(&self, name: &str) -> PlatformResult<()> {
        self.record(Call::RemoveQos(name.to_string()));
        Ok(())
    }

    fn flush_standby(&self, bytes: u64) -> PlatformResult<()> {
        self.record(Call::FlushStandby(bytes));
        Ok(())
    }

    fn run_trim_step(&self, _tool: &Path, step: TrimStep) -> PlatformResult<()> {
        if self.state().fail_trim_tool {
            return Err(PlatformError::NotFound("emptystandbylist.exe".into()));
        }
        self.record(Call::TrimStep(step));
        Ok(())
    }
}

impl SessionControl for FakePlatform {
    fn relaunch_shell(&self, shell: &str) -> PlatformResult<()> {
        self.record(Call::RelaunchShell(shell.to_string()));
        Ok(())
    }

    fn resume_ambient(&self, mode: &str, launch_args: &[String]) -> PlatformResult<()> {
        self.record(Call::ResumeAmbient(mode.to_string(), launch_args.to_vec()));
        Ok(())
    }
}
