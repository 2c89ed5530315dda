//! Job rollout: unneeded instances, canaries, then bounded bulk updates.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{info, instrument, warn};

use crate::context::UpdateContext;
use crate::instance_deleter::InstanceDeleter;
use crate::instance_updater::InstanceUpdater;
use crate::plan::instance::Instance;
use crate::plan::job::Job;
use crate::plan::resource_pool::ResourcePool;
use crate::plan::update_policy::WatchTime;
use crate::{DirectorError, DirectorResult};

/// Outcome of one job's rollout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub job: String,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub update_errors: usize,
    pub halt_reason: Option<String>,
}

#[derive(Debug, Default)]
struct RolloutCounters {
    updated: usize,
    update_errors: usize,
    halted: bool,
    halt_reason: Option<String>,
}

/// Failure accounting shared by every unit of a rollout.
struct Rollout {
    job: String,
    max_errors: i32,
    counters: Mutex<RolloutCounters>,
}

impl Rollout {
    fn counters(&self) -> std::sync::MutexGuard<'_, RolloutCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_halted(&self) -> bool {
        self.counters().halted
    }

    fn record_success(&self) {
        self.counters().updated += 1;
    }

    /// Count a failure; returns whether the rollout is now halted.
    ///
    /// A canary failure halts immediately, as does any failure when
    /// `max_errors` is negative. Otherwise the rollout halts once the
    /// failure count exceeds `max_errors`.
    fn record_failure(&self, err: &DirectorError, canary: bool) -> bool {
        let mut counters = self.counters();
        counters.update_errors += 1;
        let over_limit = i64::try_from(counters.update_errors).unwrap_or(i64::MAX)
            > i64::from(self.max_errors);
        if canary || self.max_errors < 0 || over_limit {
            if !counters.halted {
                counters.halted = true;
                counters.halt_reason = Some(err.to_string());
            }
        } else {
            warn!(
                job = %self.job,
                update_errors = counters.update_errors,
                max_errors = self.max_errors,
                error = %err,
                "Instance failed, continuing rollout"
            );
        }
        counters.halted
    }
}

type Slots = Arc<Mutex<BTreeMap<u32, Instance>>>;

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, BTreeMap<u32, Instance>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct JobUpdater {
    ctx: Arc<UpdateContext>,
}

impl JobUpdater {
    pub fn new(ctx: Arc<UpdateContext>) -> Self {
        Self { ctx }
    }

    #[instrument(skip_all, fields(job = %job.name))]
    pub async fn update(&self, job: &mut Job) -> DirectorResult<JobReport> {
        let mut report = JobReport {
            job: job.name.clone(),
            ..JobReport::default()
        };

        let unneeded = std::mem::take(&mut job.unneeded_instances);
        if !unneeded.is_empty() {
            report.deleted = unneeded.len();
            info!(count = unneeded.len(), "Deleting unneeded instances");
            let deleter = Arc::new(InstanceDeleter::new(self.ctx.clone()));
            self.ctx
                .task_pool(self.ctx.config.max_threads)
                .process_all(unneeded.into_iter().map(|instance| {
                    let deleter = deleter.clone();
                    async move { deleter.delete(instance).await }
                }))
                .await?;
        }

        let (changed, unchanged): (Vec<_>, Vec<_>) = std::mem::take(&mut job.instances)
            .into_iter()
            .partition(Instance::changed);
        report.unchanged = unchanged.len();
        job.instances = unchanged;
        if changed.is_empty() {
            info!("Job is up to date");
            return Ok(report);
        }

        let policy = job.update.clone();
        let order: Vec<u32> = changed.iter().map(|i| i.index).collect();
        let canary_count = (policy.canaries as usize).min(order.len());
        let (canaries, bulk) = order.split_at(canary_count);
        info!(
            changed = order.len(),
            canaries = canary_count,
            max_in_flight = policy.max_in_flight,
            max_errors = policy.max_errors,
            "Updating job"
        );

        let slots: Slots = Arc::new(Mutex::new(
            changed.into_iter().map(|i| (i.index, i)).collect(),
        ));
        let rollout = Arc::new(Rollout {
            job: job.name.clone(),
            max_errors: policy.max_errors,
            counters: Mutex::new(RolloutCounters::default()),
        });
        let unit = |index: u32, watch: WatchTime, canary: bool| {
            update_unit(
                self.ctx.clone(),
                job.resource_pool.clone(),
                slots.clone(),
                rollout.clone(),
                index,
                watch,
                canary,
            )
        };

        let result = async {
            for &index in canaries {
                self.ctx.cancellation.check()?;
                unit(index, policy.canary_watch_time, true).await?;
            }
            self.ctx
                .task_pool(policy.max_in_flight as usize)
                .process_all(
                    bulk.iter()
                        .map(|&index| unit(index, policy.update_watch_time, false)),
                )
                .await?;
            Ok::<_, DirectorError>(())
        }
        .await;

        job.instances.extend(std::mem::take(&mut *lock_slots(&slots)).into_values());
        job.sort_instances();

        let counters = rollout.counters();
        report.updated = counters.updated;
        report.update_errors = counters.update_errors;
        report.halt_reason = counters.halt_reason.clone();
        drop(counters);

        match result {
            Ok(()) => {
                info!(
                    updated = report.updated,
                    update_errors = report.update_errors,
                    "Job updated"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(error = %err, "Job rollout halted");
                Err(err)
            }
        }
    }
}

async fn update_unit(
    ctx: Arc<UpdateContext>,
    pool: Arc<ResourcePool>,
    slots: Slots,
    rollout: Arc<Rollout>,
    index: u32,
    watch: WatchTime,
    canary: bool,
) -> DirectorResult<()> {
    if rollout.is_halted() {
        return Ok(());
    }
    let Some(mut instance) = lock_slots(&slots).remove(&index) else {
        return Ok(());
    };

    let updater = InstanceUpdater::new(ctx, pool, watch, canary);
    let result = updater.update(&mut instance).await;
    lock_slots(&slots).insert(index, instance);

    match result {
        Ok(_) => {
            rollout.record_success();
            Ok(())
        }
        Err(DirectorError::Cancelled) => Err(DirectorError::Cancelled),
        Err(err) => {
            if rollout.record_failure(&err, canary) {
                Err(DirectorError::Rollback {
                    job: rollout.job.clone(),
                    source: Box::new(err),
                })
            } else {
                Ok(())
            }
        }
    }
}
