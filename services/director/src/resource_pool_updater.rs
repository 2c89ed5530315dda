//! Keeps resource pools stocked with idle VMs.
//!
//! Unneeded VMs are deleted first. Each pool then recreates idle VMs whose
//! pool spec, env or network settings drifted, and creates VMs for slots
//! nothing occupies.

use std::sync::Arc;

use drydock_id::AgentId;
use drydock_networking::Reservation;
use tracing::{debug, info, instrument, warn};

use crate::cloud::{ignore_not_found, CreateVmRequest};
use crate::context::UpdateContext;
use crate::plan::resource_pool::{IdleVm, ResourcePool, UnneededVm, VmBinding};
use crate::records::VmRecord;
use crate::{DirectorError, DirectorResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub pool: String,
    pub created: usize,
    pub recreated: usize,
}

pub struct ResourcePoolUpdater {
    ctx: Arc<UpdateContext>,
    pool: Arc<ResourcePool>,
}

impl ResourcePoolUpdater {
    pub fn new(ctx: Arc<UpdateContext>, pool: Arc<ResourcePool>) -> Self {
        Self { ctx, pool }
    }

    #[instrument(skip_all, fields(pool = %self.pool.name))]
    pub async fn update(&self) -> DirectorResult<PoolReport> {
        let mut report = PoolReport {
            pool: self.pool.name.clone(),
            ..PoolReport::default()
        };
        let task_pool = self.ctx.task_pool(self.ctx.config.max_threads);

        let mut outdated = Vec::new();
        for mut vm in self.pool.idle_vms() {
            if !vm.reservation.is_fulfilled() {
                self.pool.network.reserve_for(&mut vm.reservation)?;
                self.pool.update_idle_vm(vm.clone());
            }
            let ip = reserved_ip(&vm.reservation)?;
            if vm.changed(&self.pool, &self.pool.idle_network_settings(ip)?) {
                outdated.push(vm);
            }
        }
        if !outdated.is_empty() {
            info!(count = outdated.len(), "Recreating outdated idle VMs");
            report.recreated = outdated.len();
            task_pool
                .process_all(outdated.into_iter().map(|vm| {
                    let (ctx, pool) = (self.ctx.clone(), self.pool.clone());
                    async move { recreate_idle_vm(&ctx, &pool, vm).await }
                }))
                .await?;
        }

        let missing = self.pool.missing_vm_count();
        if missing > 0 {
            info!(count = missing, "Creating missing idle VMs");
            report.created = missing;
            task_pool
                .process_all((0..missing).map(|_| {
                    let (ctx, pool) = (self.ctx.clone(), self.pool.clone());
                    async move { create_idle_vm(&ctx, &pool).await }
                }))
                .await?;
        }

        let counts = self.pool.counts();
        debug!(idle = counts.idle, allocated = counts.allocated, active = counts.active, "pool updated");
        Ok(report)
    }
}

/// Delete VMs nothing in the plan wants and give back their addresses.
#[instrument(skip_all, fields(count = vms.len()))]
pub async fn delete_unneeded_vms(ctx: &Arc<UpdateContext>, vms: Vec<UnneededVm>) -> DirectorResult<usize> {
    let count = vms.len();
    if count == 0 {
        return Ok(0);
    }
    info!("Deleting unneeded VMs");
    ctx.task_pool(ctx.config.max_threads)
        .process_all(vms.into_iter().map(|unneeded| {
            let ctx = ctx.clone();
            async move {
                ignore_not_found(ctx.cloud.delete_vm(&unneeded.vm.cid).await)?;
                ctx.records.delete_vm(&unneeded.vm.cid).await?;
                if let Some((network_name, reservation)) = &unneeded.reservation {
                    if let (Some(network), Some(ip)) = (ctx.network(network_name), reservation.ip) {
                        if reservation.reserved {
                            if let Err(e) = network.release(ip) {
                                warn!(network = %network_name, error = %e, "failed to release address");
                            }
                        }
                    }
                }
                debug!(vm_cid = %unneeded.vm.cid, "deleted unneeded VM");
                Ok::<_, DirectorError>(())
            }
        }))
        .await?;
    Ok(count)
}

fn reserved_ip(reservation: &Reservation) -> DirectorResult<drydock_networking::Address> {
    reservation
        .ip
        .filter(|_| reservation.is_fulfilled())
        .ok_or_else(|| DirectorError::Validation(format!("idle VM has no address ({})", reservation)))
}

async fn create_idle_vm(ctx: &UpdateContext, pool: &ResourcePool) -> DirectorResult<()> {
    let mut reservation = Reservation::dynamic();
    pool.network.reserve_for(&mut reservation)?;
    let ip = reserved_ip(&reservation)?;

    let mut idle = IdleVm::new(reservation);
    match boot_idle_vm(ctx, pool, &mut idle, ip).await {
        Ok(()) => {
            pool.add_idle_vm(idle)?;
            Ok(())
        }
        Err(err) => {
            if let Err(e) = pool.network.release(ip) {
                warn!(error = %e, "failed to release address of failed idle VM");
            }
            Err(err)
        }
    }
}

async fn recreate_idle_vm(ctx: &UpdateContext, pool: &ResourcePool, mut idle: IdleVm) -> DirectorResult<()> {
    if let Some(old) = idle.vm.take() {
        ignore_not_found(ctx.cloud.delete_vm(&old.cid).await)?;
        ctx.records.delete_vm(&old.cid).await?;
        debug!(vm_cid = %old.cid, "deleted outdated idle VM");
    }
    let ip = reserved_ip(&idle.reservation)?;
    boot_idle_vm(ctx, pool, &mut idle, ip).await?;
    if !pool.update_idle_vm(idle) {
        warn!("idle VM was handed out while being recreated");
    }
    Ok(())
}

/// Create a VM for `idle`, apply the idle spec and record its state.
async fn boot_idle_vm(
    ctx: &UpdateContext,
    pool: &ResourcePool,
    idle: &mut IdleVm,
    ip: drydock_networking::Address,
) -> DirectorResult<()> {
    let spec = pool.idle_spec(ip)?;
    let agent_id = AgentId::new();
    let cid = ctx
        .cloud
        .create_vm(CreateVmRequest {
            agent_id,
            stemcell: pool.stemcell_cid.clone(),
            cloud_properties: pool.spec.cloud_properties.clone(),
            networks: spec.networks.clone(),
            disks: Vec::new(),
            env: pool.env.clone(),
        })
        .await?;
    let vm = VmBinding {
        cid,
        agent_id,
        env_hash: Some(pool.env_hash().to_string()),
    };
    ctx.records
        .save_vm(&VmRecord {
            cid: vm.cid.clone(),
            agent_id,
            deployment: ctx.deployment.clone(),
            env_hash: vm.env_hash.clone(),
        })
        .await?;
    info!(vm_cid = %vm.cid, agent_id = %agent_id, "Created idle VM");
    idle.vm = Some(vm);

    let agent = ctx.agents.agent(&agent_id);
    agent.wait_until_ready().await?;
    let result = agent.apply(&spec).await?;
    if !result.is_done() {
        return Err(DirectorError::ApplyFailed {
            state: result.state,
        });
    }
    idle.current_state = agent.get_state().await?;
    Ok(())
}
