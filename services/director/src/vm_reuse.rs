//! Stemcell-keyed cache of transient VMs.
//!
//! Meant for workers that run short tasks on throwaway VMs, such as package
//! compilation, so consecutive tasks on the same stemcell skip VM creation.
//! Deployment rollouts do not go through it; instance VMs come from
//! resource pools.
//!
//! Entries are shared handles; a caller owns an entry between a successful
//! [`VmReuser::get_vm`] (or [`VmReuser::add_vm`]) and the matching
//! [`VmReuser::release`]. The cache never evicts on its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use drydock_id::StemcellCid;
use drydock_networking::{NetworkSettings, Reservation};
use tracing::debug;

use crate::plan::resource_pool::VmBinding;

/// One cached VM.
#[derive(Debug)]
pub struct VmData {
    pub reservation: Reservation,
    pub vm: VmBinding,
    pub stemcell: StemcellCid,
    pub network_settings: NetworkSettings,
    in_use: AtomicBool,
}

impl VmData {
    fn new(
        reservation: Reservation,
        vm: VmBinding,
        stemcell: StemcellCid,
        network_settings: NetworkSettings,
    ) -> Self {
        Self {
            reservation,
            vm,
            stemcell,
            network_settings,
            in_use: AtomicBool::new(false),
        }
    }

    /// Test-and-set; true if this call claimed the entry.
    fn mark_in_use(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct VmReuser {
    vms: Mutex<BTreeMap<StemcellCid, Vec<Arc<VmData>>>>,
}

impl VmReuser {
    pub fn new() -> Self {
        Self::default()
    }

    fn vms(&self) -> std::sync::MutexGuard<'_, BTreeMap<StemcellCid, Vec<Arc<VmData>>>> {
        self.vms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a free VM built from `stemcell`.
    pub fn get_vm(&self, stemcell: &StemcellCid) -> Option<Arc<VmData>> {
        let vms = self.vms();
        let found = vms
            .get(stemcell)?
            .iter()
            .find(|vm| vm.mark_in_use())
            .cloned();
        if let Some(vm) = &found {
            debug!(vm_cid = %vm.vm.cid, stemcell = %stemcell, "reusing VM");
        }
        found
    }

    /// Cached VMs for `stemcell`, claimed or not.
    pub fn get_num_vms(&self, stemcell: &StemcellCid) -> usize {
        self.vms().get(stemcell).map_or(0, Vec::len)
    }

    /// Cache a new VM. It starts out claimed by the caller.
    pub fn add_vm(
        &self,
        reservation: Reservation,
        vm: VmBinding,
        stemcell: StemcellCid,
        network_settings: NetworkSettings,
    ) -> Arc<VmData> {
        let data = Arc::new(VmData::new(reservation, vm, stemcell.clone(), network_settings));
        data.mark_in_use();
        self.vms().entry(stemcell).or_default().push(data.clone());
        data
    }

    /// Hand a claimed VM back for reuse.
    pub fn release(&self, vm: &VmData) {
        vm.in_use.store(false, Ordering::Release);
    }

    /// Forget a VM, typically after it was deleted.
    pub fn remove_vm(&self, vm: &VmData) {
        let mut vms = self.vms();
        if let Some(entries) = vms.get_mut(&vm.stemcell) {
            entries.retain(|entry| entry.vm.cid != vm.vm.cid);
            if entries.is_empty() {
                vms.remove(&vm.stemcell);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_id::{AgentId, VmCid};

    fn binding(cid: &str) -> VmBinding {
        VmBinding {
            cid: VmCid::new(cid),
            agent_id: AgentId::new(),
            env_hash: None,
        }
    }

    fn add(reuser: &VmReuser, cid: &str, stemcell: &str) -> Arc<VmData> {
        reuser.add_vm(
            Reservation::dynamic(),
            binding(cid),
            StemcellCid::new(stemcell),
            NetworkSettings::new(),
        )
    }

    #[test]
    fn test_added_vm_is_claimed_until_released() {
        let reuser = VmReuser::new();
        let stemcell = StemcellCid::new("sc-1");
        let vm = add(&reuser, "vm-1", "sc-1");

        assert!(vm.in_use());
        assert!(reuser.get_vm(&stemcell).is_none());

        reuser.release(&vm);
        let reused = reuser.get_vm(&stemcell).unwrap();
        assert_eq!(reused.vm.cid, VmCid::new("vm-1"));
        assert!(reuser.get_vm(&stemcell).is_none());
    }

    #[test]
    fn test_vms_are_keyed_by_stemcell() {
        let reuser = VmReuser::new();
        let a = add(&reuser, "vm-1", "sc-1");
        let b = add(&reuser, "vm-2", "sc-2");
        reuser.release(&a);
        reuser.release(&b);

        assert_eq!(reuser.get_num_vms(&StemcellCid::new("sc-1")), 1);
        assert_eq!(reuser.get_num_vms(&StemcellCid::new("sc-3")), 0);
        let got = reuser.get_vm(&StemcellCid::new("sc-2")).unwrap();
        assert_eq!(got.vm.cid, VmCid::new("vm-2"));
    }

    #[test]
    fn test_remove_vm() {
        let reuser = VmReuser::new();
        let stemcell = StemcellCid::new("sc-1");
        let vm = add(&reuser, "vm-1", "sc-1");
        add(&reuser, "vm-2", "sc-1");
        assert_eq!(reuser.get_num_vms(&stemcell), 2);

        reuser.remove_vm(&vm);
        assert_eq!(reuser.get_num_vms(&stemcell), 1);
    }

    #[test]
    fn test_concurrent_get_vm_claims_each_vm_once() {
        let reuser = Arc::new(VmReuser::new());
        for i in 0..4 {
            let vm = add(&reuser, &format!("vm-{i}"), "sc-1");
            reuser.release(&vm);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reuser = reuser.clone();
                std::thread::spawn(move || reuser.get_vm(&StemcellCid::new("sc-1")))
            })
            .collect();
        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(claimed, 4);
    }
}
