//! One deployment run, end to end.

use std::sync::Arc;

use drydock_id::TaskId;
use drydock_reconcile::Cancellation;
use tracing::{info, instrument, warn};

use crate::agent::AgentFactory;
use crate::binder::Binder;
use crate::cloud::Cloud;
use crate::context::UpdateContext;
use crate::instance_deleter::InstanceDeleter;
use crate::job_updater::{JobReport, JobUpdater};
use crate::lock::{LeaseStore, Lock};
use crate::plan::spec::PlanSpec;
use crate::plan::DeploymentPlan;
use crate::records::RecordStore;
use crate::resource_pool_updater::{delete_unneeded_vms, PoolReport, ResourcePoolUpdater};
use crate::{DirectorConfig, DirectorResult};

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentReport {
    pub deployment: String,
    pub deleted_vms: usize,
    /// Instances of jobs removed from the plan.
    pub deleted_instances: usize,
    pub pools: Vec<PoolReport>,
    pub jobs: Vec<JobReport>,
}

impl DeploymentReport {
    /// Whether the run touched anything.
    pub fn changed(&self) -> bool {
        self.deleted_vms > 0
            || self.deleted_instances > 0
            || self.pools.iter().any(|p| p.created > 0 || p.recreated > 0)
            || self.jobs.iter().any(|j| j.updated > 0 || j.deleted > 0 || j.update_errors > 0)
    }
}

pub struct Reconciler {
    config: DirectorConfig,
    cloud: Arc<dyn Cloud>,
    agents: Arc<dyn AgentFactory>,
    records: Arc<dyn RecordStore>,
    leases: Arc<dyn LeaseStore>,
    cancellation: Cancellation,
}

impl Reconciler {
    pub fn new(
        config: DirectorConfig,
        cloud: Arc<dyn Cloud>,
        agents: Arc<dyn AgentFactory>,
        records: Arc<dyn RecordStore>,
        leases: Arc<dyn LeaseStore>,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            config,
            cloud,
            agents,
            records,
            leases,
            cancellation,
        }
    }

    /// Validate `spec`, take the deployment lock and converge the fleet.
    ///
    /// The lock is released whether or not the run succeeds.
    #[instrument(skip_all, fields(deployment = %spec.name, task_id = %TaskId::new()))]
    pub async fn run(&self, spec: &PlanSpec) -> DirectorResult<DeploymentReport> {
        let mut plan = DeploymentPlan::from_spec(spec)?;
        let guard = Lock::deployment(self.leases.clone(), &plan.name, &self.config)
            .acquire()
            .await?;

        let result = self.reconcile(&mut plan).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release deployment lock");
        }

        match &result {
            Ok(report) => info!(
                changed = report.changed(),
                jobs = report.jobs.len(),
                "Deployment reconciled"
            ),
            Err(err) => warn!(error = %err, "Deployment failed"),
        }
        result
    }

    async fn reconcile(&self, plan: &mut DeploymentPlan) -> DirectorResult<DeploymentReport> {
        let ctx = Arc::new(UpdateContext {
            deployment: plan.name.clone(),
            config: self.config.clone(),
            cloud: self.cloud.clone(),
            agents: self.agents.clone(),
            records: self.records.clone(),
            networks: plan.networks.clone(),
            cancellation: self.cancellation.clone(),
        });
        let mut report = DeploymentReport {
            deployment: plan.name.clone(),
            ..DeploymentReport::default()
        };

        Binder::new(ctx.clone()).bind(plan).await?;

        report.deleted_vms = delete_unneeded_vms(&ctx, std::mem::take(&mut plan.unneeded_vms)).await?;

        let orphans = std::mem::take(&mut plan.unneeded_instances);
        report.deleted_instances = orphans.len();
        if !orphans.is_empty() {
            let deleter = Arc::new(InstanceDeleter::new(ctx.clone()));
            ctx.task_pool(ctx.config.max_threads)
                .process_all(orphans.into_iter().map(|instance| {
                    let deleter = deleter.clone();
                    async move { deleter.delete(instance).await }
                }))
                .await?;
        }

        for pool in &plan.resource_pools {
            ctx.cancellation.check()?;
            report
                .pools
                .push(ResourcePoolUpdater::new(ctx.clone(), pool.clone()).update().await?);
        }

        let updater = JobUpdater::new(ctx.clone());
        for job in &mut plan.jobs {
            ctx.cancellation.check()?;
            report.jobs.push(updater.update(job).await?);
        }
        Ok(report)
    }
}
