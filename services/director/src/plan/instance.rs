//! Instances of a job and their derived change flags.

use drydock_networking::Reservation;
use drydock_reconcile::{CurrentState, DesiredSpec, DiffFlags, RunState, StateDiff};

use crate::plan::resource_pool::VmBinding;
use crate::records::{DiskRecord, InstanceRecord};

/// Top-level domain of published DNS records.
pub const DNS_DOMAIN: &str = "drydock";

/// One network an instance is attached to.
#[derive(Debug, Clone)]
pub struct InstanceNetwork {
    pub name: String,
    pub reservation: Reservation,
    pub default: Vec<String>,
}

/// One member of a job.
///
/// `diff` is recomputed whenever the observed state or the desired spec
/// changes, so it always describes the work left to do.
#[derive(Debug, Clone)]
pub struct Instance {
    pub job: String,
    pub index: u32,
    pub desired_state: RunState,
    /// Recreate the VM regardless of drift (instance or deployment request).
    pub recreate: bool,
    pub restart: bool,
    pub networks: Vec<InstanceNetwork>,
    pub vm: Option<VmBinding>,
    pub disk: Option<DiskRecord>,
    /// Env hash VMs of this instance's pool are created with.
    pub pool_env_hash: String,
    spec: DesiredSpec,
    current_state: CurrentState,
    diff: StateDiff,
}

impl Instance {
    pub fn new(
        job: impl Into<String>,
        index: u32,
        desired_state: RunState,
        networks: Vec<InstanceNetwork>,
        spec: DesiredSpec,
        pool_env_hash: impl Into<String>,
    ) -> Self {
        let mut instance = Self {
            job: job.into(),
            index,
            desired_state,
            recreate: false,
            restart: false,
            networks,
            vm: None,
            disk: None,
            pool_env_hash: pool_env_hash.into(),
            spec,
            current_state: CurrentState::default(),
            diff: StateDiff::default(),
        };
        instance.recompute();
        instance
    }

    /// `job/index`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }

    pub fn spec(&self) -> &DesiredSpec {
        &self.spec
    }

    pub fn current_state(&self) -> &CurrentState {
        &self.current_state
    }

    pub fn diff(&self) -> StateDiff {
        self.diff
    }

    pub fn changed(&self) -> bool {
        self.diff.changed()
    }

    pub fn set_spec(&mut self, spec: DesiredSpec) {
        self.spec = spec;
        self.recompute();
    }

    pub fn set_current_state(&mut self, state: CurrentState) {
        self.current_state = state;
        self.recompute();
    }

    pub fn set_flags(&mut self, recreate: bool, restart: bool) {
        self.recreate = recreate;
        self.restart = restart;
        self.recompute();
    }

    /// Clear one-shot requests once they have been carried out.
    pub fn clear_flags(&mut self) {
        self.set_flags(false, false);
    }

    /// Persistent disk size in MiB the instance has now.
    pub fn disk_size(&self) -> u64 {
        self.disk.as_ref().map_or(0, |d| d.size_mib)
    }

    /// Whether the VM reports a persistent disk in use.
    pub fn disk_attached(&self) -> bool {
        self.current_state.persistent_disk.unwrap_or(0) > 0
    }

    pub fn disk_changed(&self) -> bool {
        self.disk_size() != self.spec.persistent_disk
    }

    fn recompute(&mut self) {
        if self.desired_state == RunState::Detached {
            // Only a VM that still exists has anything left to do.
            self.diff = StateDiff {
                state: self.vm.is_some() || self.current_state.job_state.is_some(),
                ..StateDiff::default()
            };
            return;
        }
        let env_changed = self
            .vm
            .as_ref()
            .is_some_and(|vm| vm.env_hash.as_deref() != Some(self.pool_env_hash.as_str()));
        let flags = DiffFlags {
            recreate: self.recreate || env_changed,
            restart: self.restart,
        };
        self.diff = StateDiff::compute(&self.spec, &self.current_state, self.desired_state, flags);
    }

    /// Bind a VM and refresh drift against its reported state.
    pub fn bind_vm(&mut self, vm: Option<VmBinding>, state: CurrentState) {
        self.vm = vm;
        self.set_current_state(state);
    }

    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            deployment: self.spec.deployment.clone(),
            job: self.job.clone(),
            index: self.index,
            state: self.desired_state,
            vm: self.vm.as_ref().map(|vm| vm.cid.clone()),
            disk: self.disk.clone(),
        }
    }
}

/// An instance from an earlier run that the plan no longer declares.
#[derive(Debug, Clone)]
pub struct UnneededInstance {
    pub job: String,
    pub index: u32,
    pub vm: Option<VmBinding>,
    pub disk: Option<DiskRecord>,
    /// Network name and reservation held by the instance.
    pub reservations: Vec<(String, Reservation)>,
    pub dns_names: Vec<String>,
}

impl UnneededInstance {
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }
}

/// `index.job.network.deployment.drydock`, each label canonicalized.
pub fn dns_record_name(index: u32, job: &str, network: &str, deployment: &str) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        index,
        canonical(job),
        canonical(network),
        canonical(deployment),
        DNS_DOMAIN
    )
}

fn canonical(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
