//! Removal of instances the plan no longer declares.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::agent::{drain_and_stop, DrainMode};
use crate::cloud::{ignore_not_attached, ignore_not_found};
use crate::context::UpdateContext;
use crate::plan::instance::UnneededInstance;
use crate::DirectorResult;

pub struct InstanceDeleter {
    ctx: Arc<UpdateContext>,
}

impl InstanceDeleter {
    pub fn new(ctx: Arc<UpdateContext>) -> Self {
        Self { ctx }
    }

    /// Drain and stop the job, drop the disk and VM, give back addresses
    /// and forget the instance. Missing cloud resources are not errors.
    #[instrument(skip_all, fields(instance = %instance.name()))]
    pub async fn delete(&self, instance: UnneededInstance) -> DirectorResult<()> {
        let name = instance.name();
        self.delete_inner(instance)
            .await
            .map_err(|err| err.for_instance(name))
    }

    async fn delete_inner(&self, instance: UnneededInstance) -> DirectorResult<()> {
        if let Some(vm) = &instance.vm {
            let agent = self.ctx.agents.agent(&vm.agent_id);
            drain_and_stop(agent.as_ref(), &DrainMode::Shutdown, &self.ctx.cancellation).await?;

            if let Some(disk) = &instance.disk {
                agent.unmount_disk(&disk.cid).await?;
                ignore_not_attached(self.ctx.cloud.detach_disk(&vm.cid, &disk.cid).await)?;
            }
            ignore_not_found(self.ctx.cloud.delete_vm(&vm.cid).await)?;
            self.ctx.records.delete_vm(&vm.cid).await?;
        }

        if let Some(disk) = &instance.disk {
            ignore_not_found(self.ctx.cloud.delete_disk(&disk.cid).await)?;
        }

        for (network_name, reservation) in &instance.reservations {
            let (Some(network), Some(ip)) = (self.ctx.network(network_name), reservation.ip) else {
                continue;
            };
            if !reservation.reserved {
                continue;
            }
            if let Err(e) = network.release(ip) {
                warn!(network = %network_name, error = %e, "failed to release address");
            }
        }

        if !instance.dns_names.is_empty() {
            self.ctx.records.delete_dns(&instance.dns_names).await?;
        }
        self.ctx
            .records
            .delete_instance(&self.ctx.deployment, &instance.job, instance.index)
            .await?;
        info!("Deleted instance");
        Ok(())
    }
}
