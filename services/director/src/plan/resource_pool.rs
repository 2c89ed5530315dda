//! Resource pools: bounded sets of VM slots with an arena of idle VMs.

use std::sync::{Arc, Mutex};

use drydock_id::{AgentId, StemcellCid, VmCid};
use drydock_networking::{Address, Network, NetworkSettings, Reservation};
use drydock_reconcile::{CurrentState, DesiredSpec, ResourcePoolSpec};

use crate::{DirectorError, DirectorResult};

/// Defaults an idle VM's only network provides.
pub const IDLE_NETWORK_DEFAULTS: [&str; 2] = ["dns", "gateway"];

/// A VM as known to the director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBinding {
    pub cid: VmCid,
    pub agent_id: AgentId,
    pub env_hash: Option<String>,
}

/// A pooled VM that runs no job.
#[derive(Debug, Clone)]
pub struct IdleVm {
    /// Arena id within the owning pool.
    pub id: u64,
    pub vm: Option<VmBinding>,
    /// Instance (`job/index`) this VM was handed to, if any.
    pub bound_instance: Option<String>,
    pub reservation: Reservation,
    pub current_state: CurrentState,
}

impl IdleVm {
    pub fn new(reservation: Reservation) -> Self {
        Self {
            id: 0,
            vm: None,
            bound_instance: None,
            reservation,
            current_state: CurrentState::default(),
        }
    }

    pub fn ip(&self) -> Option<Address> {
        self.reservation.ip
    }

    pub fn networks_changed(&self, desired: &NetworkSettings) -> bool {
        self.current_state.networks.as_ref() != Some(desired)
    }

    pub fn resource_pool_changed(&self, pool: &ResourcePool) -> bool {
        let env_changed = self
            .vm
            .as_ref()
            .is_some_and(|vm| vm.env_hash.as_deref() != Some(pool.env_hash()));
        env_changed || self.current_state.resource_pool.as_ref() != Some(&pool.spec)
    }

    pub fn changed(&self, pool: &ResourcePool, desired: &NetworkSettings) -> bool {
        self.resource_pool_changed(pool) || self.networks_changed(desired)
    }
}

/// A VM left over from an earlier run that nothing in the plan wants.
#[derive(Debug, Clone)]
pub struct UnneededVm {
    pub vm: VmBinding,
    /// Network name and the address the VM held.
    pub reservation: Option<(String, Reservation)>,
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub idle: usize,
    pub allocated: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<IdleVm>,
    allocated: Vec<IdleVm>,
    active: usize,
    next_id: u64,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.allocated.len() + self.active
    }
}

/// A named pool of identical VMs.
///
/// `idle + allocated + active` never exceeds `size`; transitions are
/// serialized behind one lock.
#[derive(Debug)]
pub struct ResourcePool {
    pub name: String,
    pub size: usize,
    pub deployment: String,
    pub spec: ResourcePoolSpec,
    pub stemcell_cid: StemcellCid,
    pub network: Arc<Network>,
    pub env: serde_json::Value,
    env_hash: String,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(
        deployment: &str,
        spec: ResourcePoolSpec,
        size: usize,
        stemcell_cid: StemcellCid,
        network: Arc<Network>,
        env: serde_json::Value,
    ) -> Self {
        let env_hash = drydock_reconcile::SpecHash::from_json(&env).to_string();
        Self {
            name: spec.name.clone(),
            size,
            deployment: deployment.to_string(),
            spec,
            stemcell_cid,
            network,
            env,
            env_hash,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn env_hash(&self) -> &str {
        &self.env_hash
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capacity_error(&self) -> DirectorError {
        DirectorError::Capacity {
            pool: self.name.clone(),
            size: self.size,
        }
    }

    /// Hand out an idle VM, or grant a creation slot if none is idle.
    ///
    /// `Ok(None)` means the caller must create the VM itself; the slot is
    /// already counted as active.
    pub fn allocate_vm(&self) -> DirectorResult<Option<IdleVm>> {
        let mut state = self.lock_state();
        if !state.idle.is_empty() {
            let vm = state.idle.remove(0);
            state.allocated.push(vm.clone());
            return Ok(Some(vm));
        }
        if state.total() >= self.size {
            return Err(self.capacity_error());
        }
        state.active += 1;
        Ok(None)
    }

    /// Track a new idle VM and return its arena id.
    pub fn add_idle_vm(&self, mut vm: IdleVm) -> DirectorResult<u64> {
        let mut state = self.lock_state();
        if state.total() >= self.size {
            return Err(self.capacity_error());
        }
        state.next_id += 1;
        vm.id = state.next_id;
        let id = vm.id;
        state.idle.push(vm);
        Ok(id)
    }

    /// Count a VM an instance already owns.
    pub fn mark_active_vm(&self) -> DirectorResult<()> {
        let mut state = self.lock_state();
        if state.total() >= self.size {
            return Err(self.capacity_error());
        }
        state.active += 1;
        Ok(())
    }

    /// Give back a slot whose VM was deleted.
    pub fn release_active_vm(&self) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
    }

    /// Free slots not yet backed by a VM.
    pub fn missing_vm_count(&self) -> usize {
        self.size.saturating_sub(self.lock_state().total())
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.lock_state();
        PoolCounts {
            idle: state.idle.len(),
            allocated: state.allocated.len(),
            active: state.active,
        }
    }

    /// Snapshot of the idle VMs.
    pub fn idle_vms(&self) -> Vec<IdleVm> {
        self.lock_state().idle.clone()
    }

    /// Replace an idle VM by arena id; returns false if it is gone.
    pub fn update_idle_vm(&self, vm: IdleVm) -> bool {
        let mut state = self.lock_state();
        match state.idle.iter_mut().find(|v| v.id == vm.id) {
            Some(slot) => {
                *slot = vm;
                true
            }
            None => false,
        }
    }

    /// Network settings for an idle VM holding `ip`.
    pub fn idle_network_settings(&self, ip: Address) -> DirectorResult<NetworkSettings> {
        let defaults: Vec<String> = IDLE_NETWORK_DEFAULTS.iter().map(|s| s.to_string()).collect();
        let setting = self.network.network_settings(ip, &defaults)?;
        Ok(NetworkSettings::from([(self.network.name().to_string(), setting)]))
    }

    /// Spec applied to an idle VM holding `ip`.
    pub fn idle_spec(&self, ip: Address) -> DirectorResult<DesiredSpec> {
        Ok(DesiredSpec::idle(
            self.deployment.clone(),
            self.spec.clone(),
            self.idle_network_settings(ip)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_networking::SubnetSpec;
    use drydock_reconcile::StemcellSpec;

    fn pool(size: usize) -> ResourcePool {
        let network = Network::new(
            "default",
            &[SubnetSpec {
                range: "10.0.0.0/24".into(),
                gateway: Some("10.0.0.1".into()),
                ..SubnetSpec::default()
            }],
        )
        .unwrap();
        ResourcePool::new(
            "dep",
            ResourcePoolSpec {
                name: "small".into(),
                stemcell: StemcellSpec {
                    name: "ubuntu".into(),
                    version: "1".into(),
                },
                cloud_properties: serde_json::json!({"type": "m1"}),
            },
            size,
            StemcellCid::new("sc-1"),
            Arc::new(network),
            serde_json::json!({}),
        )
    }

    #[test]
    fn test_allocate_prefers_idle_vm() {
        let pool = pool(2);
        let id = pool.add_idle_vm(IdleVm::new(Reservation::dynamic())).unwrap();

        let vm = pool.allocate_vm().unwrap().unwrap();
        assert_eq!(vm.id, id);
        assert_eq!(pool.counts(), PoolCounts { idle: 0, allocated: 1, active: 0 });
    }

    #[test]
    fn test_allocate_grants_slot_until_capacity() {
        let pool = pool(2);
        assert!(pool.allocate_vm().unwrap().is_none());
        assert!(pool.allocate_vm().unwrap().is_none());
        assert!(matches!(
            pool.allocate_vm().unwrap_err(),
            DirectorError::Capacity { size: 2, .. }
        ));
        assert_eq!(pool.counts().active, 2);
    }

    #[test]
    fn test_capacity_is_shared() {
        let pool = pool(2);
        pool.mark_active_vm().unwrap();
        pool.add_idle_vm(IdleVm::new(Reservation::dynamic())).unwrap();
        assert!(pool.add_idle_vm(IdleVm::new(Reservation::dynamic())).is_err());
        assert!(pool.mark_active_vm().is_err());
        assert_eq!(pool.missing_vm_count(), 0);

        pool.release_active_vm();
        assert_eq!(pool.missing_vm_count(), 1);
    }

    #[test]
    fn test_idle_vm_drift() {
        let pool = pool(1);
        let ip = pool.network.allocate_dynamic().unwrap();
        let spec = pool.idle_spec(ip).unwrap();
        let mut vm = IdleVm::new(Reservation::dynamic());
        vm.vm = Some(VmBinding {
            cid: VmCid::new("vm-1"),
            agent_id: AgentId::new(),
            env_hash: Some(pool.env_hash().to_string()),
        });
        vm.current_state = CurrentState::from_applied(&spec, None);
        assert!(!vm.changed(&pool, &spec.networks));

        let other = pool.idle_network_settings(ip + 1).unwrap();
        assert!(vm.networks_changed(&other));

        vm.vm.as_mut().unwrap().env_hash = Some("sha256:old".into());
        assert!(vm.resource_pool_changed(&pool));
    }
}
