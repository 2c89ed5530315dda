//! In-memory cloud and agents.
//!
//! Both keep a journal of every call so tests can assert ordering, and
//! both accept injected faults. The `director` binary runs against them
//! in development.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use drydock_id::{AgentId, DiskCid, VmCid};
use drydock_networking::NetworkSettings;
use drydock_reconcile::{CurrentState, DesiredSpec, JobState};
use tracing::debug;

use crate::agent::{Agent, AgentError, AgentFactory, ApplyResult, DrainDirective, DrainMode};
use crate::cloud::{Cloud, CloudError, CreateVmRequest};

/// A call made against [`SimCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    CreateVm {
        vm: VmCid,
        agent_id: AgentId,
        disks: Vec<DiskCid>,
    },
    DeleteVm(VmCid),
    CreateDisk {
        disk: DiskCid,
        size_mib: u64,
    },
    DeleteDisk(DiskCid),
    AttachDisk {
        vm: VmCid,
        disk: DiskCid,
    },
    DetachDisk {
        vm: VmCid,
        disk: DiskCid,
    },
    ConfigureNetworks(VmCid),
}

#[derive(Debug, Clone)]
struct SimVm {
    agent_id: AgentId,
    networks: NetworkSettings,
    disks: BTreeSet<DiskCid>,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    vms: BTreeMap<VmCid, SimVm>,
    disks: BTreeMap<DiskCid, u64>,
    calls: Vec<CloudCall>,
    vm_quota: Option<usize>,
    recreate_on_configure: bool,
    failing_attach: bool,
}

impl CloudState {
    fn next_cid(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct SimCloud {
    state: Mutex<CloudState>,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail `create_vm` once `quota` VMs exist.
    pub fn set_vm_quota(&self, quota: usize) {
        self.state().vm_quota = Some(quota);
    }

    /// Answer every `configure_networks` with "must be recreated".
    pub fn require_recreate_on_configure(&self, enabled: bool) {
        self.state().recreate_on_configure = enabled;
    }

    /// Fail every `attach_disk` with a provider error.
    pub fn fail_attach(&self, enabled: bool) {
        self.state().failing_attach = enabled;
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn vm_cids(&self) -> Vec<VmCid> {
        self.state().vms.keys().cloned().collect()
    }

    pub fn agent_of(&self, vm: &VmCid) -> Option<AgentId> {
        self.state().vms.get(vm).map(|v| v.agent_id)
    }

    pub fn networks_of(&self, vm: &VmCid) -> Option<NetworkSettings> {
        self.state().vms.get(vm).map(|v| v.networks.clone())
    }

    pub fn disk_cids(&self) -> Vec<DiskCid> {
        self.state().disks.keys().cloned().collect()
    }

    pub fn attached_disks(&self, vm: &VmCid) -> Vec<DiskCid> {
        self.state()
            .vms
            .get(vm)
            .map(|v| v.disks.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn vm_not_found(vm: &VmCid) -> CloudError {
    CloudError::NotFound {
        kind: "vm",
        cid: vm.to_string(),
    }
}

fn disk_not_found(disk: &DiskCid) -> CloudError {
    CloudError::NotFound {
        kind: "disk",
        cid: disk.to_string(),
    }
}

#[async_trait]
impl Cloud for SimCloud {
    async fn create_vm(&self, request: CreateVmRequest) -> Result<VmCid, CloudError> {
        let mut state = self.state();
        if state.vm_quota.is_some_and(|quota| state.vms.len() >= quota) {
            return Err(CloudError::Capacity(format!(
                "VM quota of {} reached",
                state.vms.len()
            )));
        }
        let cid = VmCid::new(state.next_cid("vm"));
        state.vms.insert(
            cid.clone(),
            SimVm {
                agent_id: request.agent_id,
                networks: request.networks,
                disks: BTreeSet::new(),
            },
        );
        state.calls.push(CloudCall::CreateVm {
            vm: cid.clone(),
            agent_id: request.agent_id,
            disks: request.disks,
        });
        debug!(vm_cid = %cid, "sim: created VM");
        Ok(cid)
    }

    async fn delete_vm(&self, vm: &VmCid) -> Result<(), CloudError> {
        let mut state = self.state();
        state.calls.push(CloudCall::DeleteVm(vm.clone()));
        state.vms.remove(vm).map(|_| ()).ok_or_else(|| vm_not_found(vm))
    }

    async fn create_disk(
        &self,
        size_mib: u64,
        _vm_hint: Option<&VmCid>,
    ) -> Result<DiskCid, CloudError> {
        let mut state = self.state();
        let cid = DiskCid::new(state.next_cid("disk"));
        state.disks.insert(cid.clone(), size_mib);
        state.calls.push(CloudCall::CreateDisk {
            disk: cid.clone(),
            size_mib,
        });
        Ok(cid)
    }

    async fn delete_disk(&self, disk: &DiskCid) -> Result<(), CloudError> {
        let mut state = self.state();
        state.calls.push(CloudCall::DeleteDisk(disk.clone()));
        if state.disks.remove(disk).is_none() {
            return Err(disk_not_found(disk));
        }
        for vm in state.vms.values_mut() {
            vm.disks.remove(disk);
        }
        Ok(())
    }

    async fn attach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError> {
        let mut state = self.state();
        state.calls.push(CloudCall::AttachDisk {
            vm: vm.clone(),
            disk: disk.clone(),
        });
        if state.failing_attach {
            return Err(CloudError::Provider(format!("cannot attach disk '{}'", disk)));
        }
        if !state.disks.contains_key(disk) {
            return Err(disk_not_found(disk));
        }
        let entry = state.vms.get_mut(vm).ok_or_else(|| vm_not_found(vm))?;
        entry.disks.insert(disk.clone());
        Ok(())
    }

    async fn detach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError> {
        let mut state = self.state();
        state.calls.push(CloudCall::DetachDisk {
            vm: vm.clone(),
            disk: disk.clone(),
        });
        let entry = state.vms.get_mut(vm).ok_or_else(|| vm_not_found(vm))?;
        if entry.disks.remove(disk) {
            Ok(())
        } else {
            Err(CloudError::NotAttached {
                vm: vm.clone(),
                disk: disk.clone(),
            })
        }
    }

    async fn configure_networks(
        &self,
        vm: &VmCid,
        networks: &NetworkSettings,
    ) -> Result<(), CloudError> {
        let mut state = self.state();
        state.calls.push(CloudCall::ConfigureNetworks(vm.clone()));
        if state.recreate_on_configure {
            return Err(CloudError::VmMustBeRecreated(vm.clone()));
        }
        let entry = state.vms.get_mut(vm).ok_or_else(|| vm_not_found(vm))?;
        entry.networks = networks.clone();
        Ok(())
    }
}

/// A call made against a [`SimAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCall {
    pub agent_id: AgentId,
    /// Operation name; drains read `drain:<mode>`.
    pub operation: String,
}

#[derive(Debug, Default)]
struct Fleet {
    states: BTreeMap<AgentId, CurrentState>,
    calls: Vec<AgentCall>,
    drain_reply: i64,
    status_replies: VecDeque<i64>,
    failing_apply: BTreeSet<(String, u32)>,
    never_running: BTreeSet<(String, u32)>,
    unreachable: BTreeSet<AgentId>,
    apply_delay: Option<Duration>,
    applying: usize,
    peak_applying: usize,
}

impl Fleet {
    fn record(&mut self, agent_id: AgentId, operation: impl Into<String>) {
        self.calls.push(AgentCall {
            agent_id,
            operation: operation.into(),
        });
    }

    fn identity(state: &CurrentState) -> Option<(String, u32)> {
        Some((state.job.as_ref()?.name.clone(), state.index?))
    }
}

/// Hands out [`SimAgent`]s sharing one simulated fleet. Agents seen for
/// the first time start with an empty state.
#[derive(Debug, Clone, Default)]
pub struct SimAgentFactory {
    fleet: Arc<Mutex<Fleet>>,
}

impl SimAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn fleet(&self) -> std::sync::MutexGuard<'_, Fleet> {
        lock_fleet(&self.fleet)
    }

    /// Seconds answered to `shutdown`/`update` drains.
    pub fn set_drain_reply(&self, secs: i64) {
        self.fleet().drain_reply = secs;
    }

    /// Seconds answered to successive `status` drains; 0 once exhausted.
    pub fn push_status_replies(&self, replies: impl IntoIterator<Item = i64>) {
        self.fleet().status_replies.extend(replies);
    }

    /// Make full applies for `job/index` report failure.
    pub fn fail_apply(&self, job: &str, index: u32) {
        self.fleet().failing_apply.insert((job.to_string(), index));
    }

    /// Keep `job/index` failing after start.
    pub fn never_running(&self, job: &str, index: u32) {
        self.fleet().never_running.insert((job.to_string(), index));
    }

    /// Make every call to `agent_id` time out.
    pub fn set_unreachable(&self, agent_id: AgentId) {
        self.fleet().unreachable.insert(agent_id);
    }

    /// Hold every full apply for `delay` so concurrent applies overlap.
    pub fn set_apply_delay(&self, delay: Duration) {
        self.fleet().apply_delay = Some(delay);
    }

    /// Most full applies that were in progress at once.
    pub fn peak_applying(&self) -> usize {
        self.fleet().peak_applying
    }

    pub fn set_state(&self, agent_id: AgentId, state: CurrentState) {
        self.fleet().states.insert(agent_id, state);
    }

    pub fn state_of(&self, agent_id: &AgentId) -> Option<CurrentState> {
        self.fleet().states.get(agent_id).cloned()
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.fleet().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.fleet().calls.clear();
    }
}

fn lock_fleet(fleet: &Mutex<Fleet>) -> std::sync::MutexGuard<'_, Fleet> {
    fleet.lock().unwrap_or_else(|e| e.into_inner())
}

impl AgentFactory for SimAgentFactory {
    fn agent(&self, agent_id: &AgentId) -> Arc<dyn Agent> {
        Arc::new(SimAgent {
            agent_id: *agent_id,
            fleet: self.fleet.clone(),
        })
    }
}

pub struct SimAgent {
    agent_id: AgentId,
    fleet: Arc<Mutex<Fleet>>,
}

impl SimAgent {
    /// Journal the call and fail if the agent is unreachable.
    fn call(&self, operation: &'static str) -> Result<std::sync::MutexGuard<'_, Fleet>, AgentError> {
        let mut fleet = lock_fleet(&self.fleet);
        fleet.record(self.agent_id, operation);
        if fleet.unreachable.contains(&self.agent_id) {
            return Err(AgentError::Timeout {
                agent_id: self.agent_id,
                operation,
            });
        }
        Ok(fleet)
    }
}

#[async_trait]
impl Agent for SimAgent {
    fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    async fn apply(&self, spec: &DesiredSpec) -> Result<ApplyResult, AgentError> {
        let full = spec.configuration_hash.is_some();
        let delay = {
            let mut fleet = self.call("apply")?;
            if full {
                fleet.applying += 1;
                fleet.peak_applying = fleet.peak_applying.max(fleet.applying);
            }
            fleet.apply_delay.filter(|_| full)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut fleet = lock_fleet(&self.fleet);
        if full {
            fleet.applying -= 1;
        }
        let identity = spec.job.as_ref().map(|job| (job.name.clone(), spec.index));
        if full && identity.as_ref().is_some_and(|id| fleet.failing_apply.contains(id)) {
            return Ok(ApplyResult {
                state: "failed".to_string(),
                agent_task_id: Some(uuid::Uuid::new_v4().to_string()),
            });
        }
        let job_state = spec.job.as_ref().map(|_| JobState::Stopped);
        fleet
            .states
            .insert(self.agent_id, CurrentState::from_applied(spec, job_state));
        Ok(ApplyResult {
            state: "done".to_string(),
            agent_task_id: Some(uuid::Uuid::new_v4().to_string()),
        })
    }

    async fn get_state(&self) -> Result<CurrentState, AgentError> {
        let mut fleet = self.call("get_state")?;
        Ok(fleet.states.entry(self.agent_id).or_default().clone())
    }

    async fn drain(&self, mode: &DrainMode) -> Result<DrainDirective, AgentError> {
        let mut fleet = self.call("drain")?;
        if let Some(last) = fleet.calls.last_mut() {
            last.operation = format!("drain:{}", mode.as_str());
        }
        Ok(match mode {
            DrainMode::Status => {
                DrainDirective::from_status_reply(fleet.status_replies.pop_front().unwrap_or(0))
            }
            DrainMode::Shutdown | DrainMode::Update(_) => DrainDirective::from_reply(fleet.drain_reply),
        })
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut fleet = self.call("stop")?;
        let state = fleet.states.entry(self.agent_id).or_default();
        if state.job.is_some() {
            state.job_state = Some(JobState::Stopped);
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), AgentError> {
        let mut fleet = self.call("start")?;
        let failing = fleet
            .states
            .get(&self.agent_id)
            .and_then(Fleet::identity)
            .is_some_and(|id| fleet.never_running.contains(&id));
        let state = fleet.states.entry(self.agent_id).or_default();
        state.job_state = Some(if failing {
            JobState::Failing
        } else {
            JobState::Running
        });
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<(), AgentError> {
        self.call("wait_until_ready").map(|_| ())
    }

    async fn mount_disk(&self, _disk: &DiskCid) -> Result<(), AgentError> {
        self.call("mount_disk").map(|_| ())
    }

    async fn unmount_disk(&self, _disk: &DiskCid) -> Result<(), AgentError> {
        self.call("unmount_disk").map(|_| ())
    }

    async fn migrate_disk(&self, _old: &DiskCid, _new: &DiskCid) -> Result<(), AgentError> {
        self.call("migrate_disk").map(|_| ())
    }

    async fn prepare_network_change(&self, networks: &NetworkSettings) -> Result<(), AgentError> {
        let mut fleet = self.call("prepare_network_change")?;
        let state = fleet.states.entry(self.agent_id).or_default();
        state.networks = Some(networks.clone());
        Ok(())
    }
}
