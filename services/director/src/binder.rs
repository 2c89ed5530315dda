//! Binds what already exists (VMs, disks, addresses, DNS records) to a
//! freshly built plan, so drift can be computed per instance.
//!
//! Runs before anything is changed in the cloud. Order matters:
//!
//! 1. observe every recorded VM through its agent
//! 2. bind instance records to plan instances, taking their addresses
//! 3. adopt VMs without an instance into their pool as idle VMs
//! 4. hand idle VMs (or creation slots) to instances without a VM
//! 5. fulfil the remaining reservations
//! 6. render desired specs and compare published DNS

use std::collections::BTreeMap;
use std::sync::Arc;

use drydock_id::VmCid;
use drydock_networking::{parse_address, Network, NetworkSettings, Reservation};
use drydock_reconcile::{CurrentState, RunState};
use tracing::{debug, info, instrument, warn};

use crate::context::UpdateContext;
use crate::plan::instance::{dns_record_name, UnneededInstance};
use crate::plan::resource_pool::{IdleVm, UnneededVm, VmBinding};
use crate::plan::DeploymentPlan;
use crate::records::{InstanceRecord, VmRecord};
use crate::{DirectorError, DirectorResult};

/// A recorded VM and the state its agent reported.
struct ObservedVm {
    binding: VmBinding,
    state: CurrentState,
}

pub struct Binder {
    ctx: Arc<UpdateContext>,
}

impl Binder {
    pub fn new(ctx: Arc<UpdateContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn bind(&self, plan: &mut DeploymentPlan) -> DirectorResult<()> {
        let deployment = plan.name.clone();
        let vm_records = self.ctx.records.vms(&deployment).await?;
        let instance_records = self.ctx.records.instances(&deployment).await?;
        info!(
            vms = vm_records.len(),
            instances = instance_records.len(),
            "Binding existing deployment"
        );

        let mut observed = self.observe_vms(vm_records).await?;
        for record in instance_records {
            self.bind_instance_record(plan, record, &mut observed)?;
        }
        for (_, vm) in std::mem::take(&mut observed) {
            adopt_idle_vm(plan, vm);
        }
        allocate_vms(plan)?;
        reserve_networks(plan)?;
        self.bind_specs(plan).await?;

        debug!(
            unneeded_vms = plan.unneeded_vms.len(),
            unneeded_instances = plan.unneeded_instances.len(),
            "bind complete"
        );
        Ok(())
    }

    async fn observe_vms(&self, records: Vec<VmRecord>) -> DirectorResult<BTreeMap<VmCid, ObservedVm>> {
        let observed = self
            .ctx
            .task_pool(self.ctx.config.max_threads)
            .process_all(records.into_iter().map(|record| {
                let agent = self.ctx.agents.agent(&record.agent_id);
                async move {
                    let state = agent.get_state().await?;
                    Ok::<_, DirectorError>(ObservedVm {
                        binding: VmBinding {
                            cid: record.cid,
                            agent_id: record.agent_id,
                            env_hash: record.env_hash,
                        },
                        state,
                    })
                }
            }))
            .await?;
        Ok(observed
            .into_iter()
            .map(|vm| (vm.binding.cid.clone(), vm))
            .collect())
    }

    fn bind_instance_record(
        &self,
        plan: &mut DeploymentPlan,
        record: InstanceRecord,
        observed: &mut BTreeMap<VmCid, ObservedVm>,
    ) -> DirectorResult<()> {
        let vm = record.vm.as_ref().and_then(|cid| observed.remove(cid));
        if record.vm.is_some() && vm.is_none() {
            warn!(instance = %record.name(), "instance record points at an unknown VM");
        }
        let deployment = plan.name.clone();
        let networks = plan.networks.clone();

        let in_plan = plan
            .job_mut(&record.job)
            .is_some_and(|job| (record.index as usize) < job.instances.len());
        if !in_plan {
            let unneeded = unneeded_instance(&deployment, &networks, record.clone(), vm);
            info!(instance = %unneeded.name(), "Instance is no longer needed");
            match plan.job_mut(&record.job) {
                Some(job) => job.unneeded_instances.push(unneeded),
                None => plan.unneeded_instances.push(unneeded),
            }
            return Ok(());
        }

        let Some(job) = plan.job_mut(&record.job) else {
            return Ok(());
        };
        let pool = job.resource_pool.clone();
        let Some(instance) = job.instances.get_mut(record.index as usize) else {
            return Ok(());
        };
        instance.disk = record.disk;

        let Some(vm) = vm else {
            return Ok(());
        };
        if let Some(reported) = &vm.state.networks {
            for binding in &mut instance.networks {
                let Some(network) = networks.get(&binding.name) else {
                    continue;
                };
                let Some(existing) = reported
                    .get(&binding.name)
                    .and_then(|setting| claim_address(network, &setting.ip))
                else {
                    continue;
                };
                if !binding.reservation.take(&existing) {
                    release_address(network, &existing);
                }
            }
        }
        pool.mark_active_vm()?;
        debug!(instance = %instance.name(), vm_cid = %vm.binding.cid, "bound VM");
        instance.bind_vm(Some(vm.binding), vm.state);
        Ok(())
    }

    async fn bind_specs(&self, plan: &mut DeploymentPlan) -> DirectorResult<()> {
        let dns_enabled = self.ctx.config.dns_enabled;
        for job in &mut plan.jobs {
            let specs = job
                .instances
                .iter()
                .map(|instance| job.desired_spec(instance, dns_enabled))
                .collect::<DirectorResult<Vec<_>>>()?;

            for (instance, spec) in job.instances.iter_mut().zip(specs) {
                let names: Vec<String> = spec.dns_records.keys().cloned().collect();
                instance.set_spec(spec);
                if names.is_empty() {
                    continue;
                }
                let published = self.ctx.records.lookup_dns(&names).await?;
                let mut state = instance.current_state().clone();
                state.dns_records = Some(published);
                instance.set_current_state(state);
            }
        }
        Ok(())
    }
}

/// Reserve the address a VM reports, if it is still free in this run.
fn claim_address(network: &Network, ip: &str) -> Option<Reservation> {
    let ip = parse_address(ip).ok()?;
    let kind = network.reserve(ip)?;
    Some(Reservation {
        ip: Some(ip),
        kind,
        reserved: true,
    })
}

fn release_address(network: &Network, reservation: &Reservation) {
    let Some(ip) = reservation.ip.filter(|_| reservation.reserved) else {
        return;
    };
    if let Err(e) = network.release(ip) {
        warn!(network = %network.name(), error = %e, "failed to release address");
    }
}

fn claim_all(networks: &BTreeMap<String, Arc<Network>>, reported: Option<&NetworkSettings>) -> Vec<(String, Reservation)> {
    reported
        .into_iter()
        .flatten()
        .filter_map(|(name, setting)| {
            let network = networks.get(name)?;
            Some((name.clone(), claim_address(network, &setting.ip)?))
        })
        .collect()
}

fn unneeded_instance(
    deployment: &str,
    networks: &BTreeMap<String, Arc<Network>>,
    record: InstanceRecord,
    vm: Option<ObservedVm>,
) -> UnneededInstance {
    let reported = vm.as_ref().and_then(|vm| vm.state.networks.as_ref());
    let dns_names = reported
        .into_iter()
        .flatten()
        .map(|(network, _)| dns_record_name(record.index, &record.job, network, deployment))
        .collect();
    UnneededInstance {
        reservations: claim_all(networks, reported),
        job: record.job,
        index: record.index,
        vm: vm.map(|vm| vm.binding),
        disk: record.disk,
        dns_names,
    }
}

/// Put a VM no instance owns into the pool it reports, or mark it for
/// deletion when the pool is gone or full.
fn adopt_idle_vm(plan: &mut DeploymentPlan, vm: ObservedVm) {
    let pool = vm
        .state
        .resource_pool
        .as_ref()
        .and_then(|rp| plan.resource_pool(&rp.name))
        .cloned();
    let Some(pool) = pool else {
        info!(vm_cid = %vm.binding.cid, "VM belongs to no resource pool, deleting");
        let reservation = claim_all(&plan.networks, vm.state.networks.as_ref()).into_iter().next();
        plan.unneeded_vms.push(UnneededVm {
            vm: vm.binding,
            reservation,
        });
        return;
    };

    let network_name = pool.network.name().to_string();
    let claimed = vm
        .state
        .networks
        .as_ref()
        .and_then(|n| n.get(&network_name))
        .and_then(|setting| claim_address(&pool.network, &setting.ip));
    let reservation = match claimed {
        Some(r) if !r.is_static() => r,
        Some(r) => {
            release_address(&pool.network, &r);
            Reservation::dynamic()
        }
        None => Reservation::dynamic(),
    };

    let mut idle = IdleVm::new(reservation.clone());
    idle.vm = Some(vm.binding.clone());
    idle.current_state = vm.state;
    if let Err(e) = pool.add_idle_vm(idle) {
        info!(vm_cid = %vm.binding.cid, pool = %pool.name, error = %e, "Pool is full, deleting VM");
        plan.unneeded_vms.push(UnneededVm {
            vm: vm.binding,
            reservation: reservation.is_fulfilled().then_some((network_name, reservation)),
        });
    }
}

/// Give every instance that needs a VM either an idle VM or a creation
/// slot. An adopted VM's address moves to the instance when it can.
fn allocate_vms(plan: &mut DeploymentPlan) -> DirectorResult<()> {
    for job in &mut plan.jobs {
        let pool = job.resource_pool.clone();
        for instance in &mut job.instances {
            if instance.vm.is_some() || instance.desired_state == RunState::Detached {
                continue;
            }
            let name = instance.name();
            let Some(idle) = pool.allocate_vm().map_err(|e| e.for_instance(name.clone()))? else {
                debug!(instance = %name, "VM will be created");
                continue;
            };
            let taken = instance
                .networks
                .iter_mut()
                .find(|n| n.name == pool.network.name())
                .is_some_and(|n| n.reservation.take(&idle.reservation));
            if !taken {
                release_address(&pool.network, &idle.reservation);
            }
            debug!(instance = %name, reused = taken, "allocated idle VM");
            instance.bind_vm(idle.vm, idle.current_state);
        }
    }
    Ok(())
}

fn reserve_networks(plan: &mut DeploymentPlan) -> DirectorResult<()> {
    for job in &mut plan.jobs {
        let job_networks = job.networks.clone();
        for instance in &mut job.instances {
            let name = instance.name();
            for binding in &mut instance.networks {
                let Some(job_network) = job_networks.iter().find(|n| n.name == binding.name) else {
                    continue;
                };
                job_network
                    .network
                    .reserve_for(&mut binding.reservation)
                    .map_err(|e| DirectorError::from(e).for_instance(name.clone()))?;
            }
        }
    }
    Ok(())
}
