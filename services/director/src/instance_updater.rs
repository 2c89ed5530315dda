//! Per-instance update state machine.
//!
//! ```text
//! Idle -> Draining -> (Recreating | Reconfiguring | DiskMigrating)*
//!      -> Applying -> Starting -> WatchingStability -> Done
//! ```
//!
//! Any step may fail; the error is logged with the phase it failed in and
//! carries the instance identity. There are no retries here.

use std::sync::Arc;

use drydock_id::{AgentId, DiskCid, VmCid};
use drydock_reconcile::{CurrentState, RunState, StateDiff};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{drain_and_stop, Agent, DrainMode};
use crate::cloud::{ignore_not_attached, ignore_not_found, CloudError, CreateVmRequest};
use crate::context::UpdateContext;
use crate::plan::instance::Instance;
use crate::plan::resource_pool::{ResourcePool, VmBinding};
use crate::plan::update_policy::WatchTime;
use crate::records::{DiskRecord, VmRecord};
use crate::{DirectorError, DirectorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Draining,
    Detaching,
    Recreating,
    Reconfiguring,
    DiskMigrating,
    Applying,
    Starting,
    WatchingStability,
    Done,
}

pub struct InstanceUpdater {
    ctx: Arc<UpdateContext>,
    pool: Arc<ResourcePool>,
    watch: WatchTime,
    canary: bool,
}

impl InstanceUpdater {
    pub fn new(
        ctx: Arc<UpdateContext>,
        pool: Arc<ResourcePool>,
        watch: WatchTime,
        canary: bool,
    ) -> Self {
        Self {
            ctx,
            pool,
            watch,
            canary,
        }
    }

    /// Drive `instance` to its desired spec and run state.
    #[instrument(skip_all, fields(instance = %instance.name(), canary = self.canary))]
    pub async fn update(&self, instance: &mut Instance) -> DirectorResult<UpdatePhase> {
        let mut phase = UpdatePhase::Idle;
        match self.run(instance, &mut phase).await {
            Ok(()) => {
                debug!("instance updated");
                Ok(phase)
            }
            Err(err) => {
                error!(failed_in = ?phase, error = %err, "Instance update failed");
                Err(err.for_instance(instance.name()))
            }
        }
    }

    async fn run(&self, instance: &mut Instance, phase: &mut UpdatePhase) -> DirectorResult<()> {
        let diff = instance.diff();
        if !diff.changed() {
            *phase = UpdatePhase::Done;
            return Ok(());
        }
        info!(changes = ?diff.changes(), "Updating instance");

        if diff.dns_only() {
            self.update_dns(instance).await?;
            *phase = UpdatePhase::Done;
            return Ok(());
        }

        if let Some(vm) = instance.vm.clone() {
            if instance.current_state().job.is_some() {
                *phase = UpdatePhase::Draining;
                let mode = drain_mode(instance, &diff);
                let agent = self.ctx.agents.agent(&vm.agent_id);
                drain_and_stop(agent.as_ref(), &mode, &self.ctx.cancellation).await?;
            }
        }

        if instance.desired_state == RunState::Detached {
            *phase = UpdatePhase::Detaching;
            self.detach(instance).await?;
            *phase = UpdatePhase::Done;
            return Ok(());
        }

        let mut recreate = diff.resource_pool || instance.vm.is_none();
        if !recreate && diff.networks {
            *phase = UpdatePhase::Reconfiguring;
            match self.reconfigure(instance).await {
                Err(DirectorError::Cloud(CloudError::VmMustBeRecreated(cid))) => {
                    info!(vm_cid = %cid, "Cloud cannot reconfigure networks, recreating VM");
                    recreate = true;
                }
                other => other?,
            }
        }
        if recreate {
            *phase = UpdatePhase::Recreating;
            self.recreate(instance).await?;
        }

        if instance.disk.is_some() && !instance.disk_attached() {
            *phase = UpdatePhase::DiskMigrating;
            self.attach_missing_disk(instance).await?;
        }
        if instance.disk_changed() {
            *phase = UpdatePhase::DiskMigrating;
            self.update_persistent_disk(instance).await?;
        }

        if diff.dns {
            self.update_dns(instance).await?;
        }

        *phase = UpdatePhase::Applying;
        let (_, agent) = self.bound_agent(instance)?;
        let result = agent.apply(instance.spec()).await?;
        if !result.is_done() {
            return Err(DirectorError::ApplyFailed {
                state: result.state,
            });
        }

        if instance.desired_state == RunState::Started {
            *phase = UpdatePhase::Starting;
            agent.start().await?;
        }

        *phase = UpdatePhase::WatchingStability;
        self.watch(instance, agent.as_ref()).await?;

        instance.clear_flags();
        self.ctx.records.save_instance(&instance.record()).await?;
        *phase = UpdatePhase::Done;
        Ok(())
    }

    fn bound_agent(&self, instance: &Instance) -> DirectorResult<(VmBinding, Arc<dyn Agent>)> {
        let vm = instance.vm.clone().ok_or(DirectorError::MissingVm)?;
        let agent = self.ctx.agents.agent(&vm.agent_id);
        Ok((vm, agent))
    }

    async fn detach(&self, instance: &mut Instance) -> DirectorResult<()> {
        if let Some(vm) = instance.vm.clone() {
            if let Some(disk) = instance.disk.clone() {
                let agent = self.ctx.agents.agent(&vm.agent_id);
                agent.unmount_disk(&disk.cid).await?;
                ignore_not_attached(self.ctx.cloud.detach_disk(&vm.cid, &disk.cid).await)?;
            }
            ignore_not_found(self.ctx.cloud.delete_vm(&vm.cid).await)?;
            self.ctx.records.delete_vm(&vm.cid).await?;
            self.pool.release_active_vm();
            info!(vm_cid = %vm.cid, "Detached instance");
        }
        instance.bind_vm(None, CurrentState::default());
        instance.clear_flags();
        self.ctx.records.save_instance(&instance.record()).await?;
        Ok(())
    }

    /// Replace the VM: delete, create with the disk list, attach, bind,
    /// wait, apply the bootstrap spec and refresh state.
    async fn recreate(&self, instance: &mut Instance) -> DirectorResult<()> {
        let disks: Vec<DiskCid> = instance.disk.iter().map(|d| d.cid.clone()).collect();

        if let Some(old) = instance.vm.take() {
            ignore_not_found(self.ctx.cloud.delete_vm(&old.cid).await)?;
            self.ctx.records.delete_vm(&old.cid).await?;
            self.ctx.records.save_instance(&instance.record()).await?;
            debug!(vm_cid = %old.cid, "deleted VM");
        }

        let agent_id = AgentId::new();
        let cid = self
            .ctx
            .cloud
            .create_vm(CreateVmRequest {
                agent_id,
                stemcell: self.pool.stemcell_cid.clone(),
                cloud_properties: self.pool.spec.cloud_properties.clone(),
                networks: instance.spec().networks.clone(),
                disks,
                env: self.pool.env.clone(),
            })
            .await?;
        let vm = VmBinding {
            cid,
            agent_id,
            env_hash: Some(self.pool.env_hash().to_string()),
        };
        self.ctx
            .records
            .save_vm(&VmRecord {
                cid: vm.cid.clone(),
                agent_id,
                deployment: self.ctx.deployment.clone(),
                env_hash: vm.env_hash.clone(),
            })
            .await?;
        info!(vm_cid = %vm.cid, agent_id = %agent_id, "Created VM");

        if let Some(disk) = &instance.disk {
            self.ctx.cloud.attach_disk(&vm.cid, &disk.cid).await?;
        }
        instance.vm = Some(vm);
        self.ctx.records.save_instance(&instance.record()).await?;

        let agent = self.ctx.agents.agent(&agent_id);
        agent.wait_until_ready().await?;
        let result = agent
            .apply(&instance.spec().bootstrap(instance.disk_size()))
            .await?;
        if !result.is_done() {
            return Err(DirectorError::ApplyFailed {
                state: result.state,
            });
        }
        let state = agent.get_state().await?;
        instance.set_current_state(state);
        instance.set_flags(false, instance.restart);
        Ok(())
    }

    async fn reconfigure(&self, instance: &mut Instance) -> DirectorResult<()> {
        let (vm, agent) = self.bound_agent(instance)?;
        let networks = &instance.spec().networks;
        agent.prepare_network_change(networks).await?;
        self.ctx.cloud.configure_networks(&vm.cid, networks).await?;
        agent.wait_until_ready().await?;
        debug!(vm_cid = %vm.cid, "reconfigured networks");
        Ok(())
    }

    /// Attach the recorded disk to a VM that came up without it, such as an
    /// idle VM taken over by a previously detached instance.
    async fn attach_missing_disk(&self, instance: &mut Instance) -> DirectorResult<()> {
        let (vm, agent) = self.bound_agent(instance)?;
        let Some(disk) = instance.disk.clone() else {
            return Ok(());
        };
        self.ctx.cloud.attach_disk(&vm.cid, &disk.cid).await?;
        agent.mount_disk(&disk.cid).await?;

        let mut state = instance.current_state().clone();
        state.persistent_disk = Some(disk.size_mib);
        instance.set_current_state(state);
        self.ctx.records.save_instance(&instance.record()).await?;
        info!(disk_cid = %disk.cid, vm_cid = %vm.cid, "Attached missing persistent disk");
        Ok(())
    }

    /// Bring the attached disk to the desired size, migrating data when a
    /// disk already exists.
    ///
    /// A new disk that fails to attach, mount or migrate is deleted again;
    /// the instance keeps its old disk.
    async fn update_persistent_disk(&self, instance: &mut Instance) -> DirectorResult<()> {
        let (vm, agent) = self.bound_agent(instance)?;
        let target = instance.spec().persistent_disk;
        let old = instance.disk.clone();

        if target > 0 {
            let cid = self.ctx.cloud.create_disk(target, Some(&vm.cid)).await?;
            if let Err(err) = self.attach_new_disk(&vm.cid, agent.as_ref(), &cid, old.as_ref()).await {
                self.discard_disk(&vm.cid, agent.as_ref(), &cid).await;
                return Err(err);
            }
            info!(disk_cid = %cid, size_mib = target, "Attached new persistent disk");
            instance.disk = Some(DiskRecord {
                cid,
                size_mib: target,
                active: true,
            });
        } else {
            instance.disk = None;
        }

        if let Some(old) = old {
            agent.unmount_disk(&old.cid).await?;
            ignore_not_attached(self.ctx.cloud.detach_disk(&vm.cid, &old.cid).await)?;
            ignore_not_found(self.ctx.cloud.delete_disk(&old.cid).await)?;
            info!(disk_cid = %old.cid, "Deleted old persistent disk");
        }

        self.ctx.records.save_instance(&instance.record()).await?;
        Ok(())
    }

    async fn attach_new_disk(
        &self,
        vm: &VmCid,
        agent: &dyn Agent,
        disk: &DiskCid,
        old: Option<&DiskRecord>,
    ) -> DirectorResult<()> {
        self.ctx.cloud.attach_disk(vm, disk).await?;
        agent.mount_disk(disk).await?;
        if let Some(old) = old {
            agent.migrate_disk(&old.cid, disk).await?;
        }
        Ok(())
    }

    /// Best-effort removal of a disk that never reached the records.
    async fn discard_disk(&self, vm: &VmCid, agent: &dyn Agent, disk: &DiskCid) {
        if let Err(e) = agent.unmount_disk(disk).await {
            debug!(disk_cid = %disk, error = %e, "unmount of discarded disk failed");
        }
        if let Err(e) = ignore_not_attached(self.ctx.cloud.detach_disk(vm, disk).await) {
            warn!(disk_cid = %disk, error = %e, "failed to detach discarded disk");
        }
        match ignore_not_found(self.ctx.cloud.delete_disk(disk).await) {
            Ok(()) => info!(disk_cid = %disk, "Deleted unused persistent disk"),
            Err(e) => warn!(disk_cid = %disk, error = %e, "failed to delete unused persistent disk"),
        }
    }

    async fn update_dns(&self, instance: &mut Instance) -> DirectorResult<()> {
        let records = instance.spec().dns_records.clone();
        if records.is_empty() {
            return Ok(());
        }
        self.ctx.records.publish_dns(&records).await?;
        let mut state = instance.current_state().clone();
        state.dns_records = Some(records);
        instance.set_current_state(state);
        Ok(())
    }

    /// Poll along the watch schedule until the desired run state shows up.
    async fn watch(&self, instance: &mut Instance, agent: &dyn Agent) -> DirectorResult<()> {
        let desired = instance.desired_state;
        let mut last = None;

        for delay in self.watch.schedule(self.ctx.config.watch_intervals) {
            tokio::time::sleep(delay).await;
            let state = agent.get_state().await?;
            let reached = match desired {
                RunState::Started => state.is_running(),
                RunState::Stopped => !state.is_running(),
                RunState::Detached => true,
            };
            last = Some(state);
            if reached {
                break;
            }
        }

        let state = match last {
            Some(state) => state,
            None => agent.get_state().await?,
        };
        let running = state.is_running();
        instance.set_current_state(state);

        match desired {
            RunState::Started if !running => Err(DirectorError::AgentJobNotRunning),
            RunState::Stopped if running => {
                warn!("job still running after stop");
                Err(DirectorError::AgentJobNotStopped)
            }
            _ => Ok(()),
        }
    }
}

/// `shutdown` when the VM, disk or networks go away or the job stops;
/// otherwise `update` with the new spec.
pub fn drain_mode(instance: &Instance, diff: &StateDiff) -> DrainMode {
    let shutdown = diff.resource_pool
        || diff.persistent_disk
        || diff.networks
        || matches!(
            instance.desired_state,
            RunState::Stopped | RunState::Detached
        );
    if shutdown {
        DrainMode::Shutdown
    } else {
        DrainMode::Update(Box::new(instance.spec().clone()))
    }
}
