//! Already-parsed deployment plan description.

use std::collections::BTreeMap;

use drydock_networking::SubnetSpec;
use drydock_reconcile::{JobTemplateSpec, PackageSpec, RunState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    /// Recreate every VM in the deployment.
    #[serde(default)]
    pub recreate: bool,
    pub networks: Vec<NetworkSpec>,
    pub resource_pools: Vec<ResourcePoolPlanSpec>,
    pub update: UpdatePolicySpec,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub subnets: Vec<SubnetSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellPlanSpec {
    pub name: String,
    pub version: String,
    /// Cloud id of the uploaded stemcell.
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolPlanSpec {
    pub name: String,
    pub size: usize,
    pub stemcell: StemcellPlanSpec,
    pub network: String,
    #[serde(default)]
    pub cloud_properties: serde_json::Value,
    #[serde(default)]
    pub env: serde_json::Value,
}

/// Rollout settings. Job-level values override the deployment defaults
/// field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicySpec {
    #[serde(default)]
    pub canaries: Option<u32>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    /// `"1000"` or `"1000-5000"`, in milliseconds.
    #[serde(default)]
    pub canary_watch_time: Option<String>,
    #[serde(default)]
    pub update_watch_time: Option<String>,
    #[serde(default)]
    pub max_errors: Option<i32>,
}

impl UpdatePolicySpec {
    /// Fill unset fields from `defaults`.
    pub fn merged_with(&self, defaults: &UpdatePolicySpec) -> UpdatePolicySpec {
        UpdatePolicySpec {
            canaries: self.canaries.or(defaults.canaries),
            max_in_flight: self.max_in_flight.or(defaults.max_in_flight),
            canary_watch_time: self
                .canary_watch_time
                .clone()
                .or_else(|| defaults.canary_watch_time.clone()),
            update_watch_time: self
                .update_watch_time
                .clone()
                .or_else(|| defaults.update_watch_time.clone()),
            max_errors: self.max_errors.or(defaults.max_errors),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNetworkSpec {
    pub name: String,
    /// One address per instance, or none for dynamic addressing.
    #[serde(default)]
    pub static_ips: Vec<String>,
    /// Which defaults (`dns`, `gateway`) this network provides.
    #[serde(default)]
    pub default: Vec<String>,
}

/// Requested state of an instance, including the one-shot actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStateSpec {
    Started,
    Stopped,
    Detached,
    /// Started, with the VM recreated.
    Recreate,
    /// Started, with the job restarted.
    Restart,
}

impl InstanceStateSpec {
    /// The run state and the `(recreate, restart)` flags it expands to.
    pub fn expand(self) -> (RunState, bool, bool) {
        match self {
            InstanceStateSpec::Started => (RunState::Started, false, false),
            InstanceStateSpec::Stopped => (RunState::Stopped, false, false),
            InstanceStateSpec::Detached => (RunState::Detached, false, false),
            InstanceStateSpec::Recreate => (RunState::Started, true, false),
            InstanceStateSpec::Restart => (RunState::Started, false, true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub template: JobTemplateSpec,
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    pub instances: u32,
    pub resource_pool: String,
    /// Persistent disk size in MiB; 0 means none.
    #[serde(default)]
    pub persistent_disk: u64,
    pub networks: Vec<JobNetworkSpec>,
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub update: Option<UpdatePolicySpec>,
    /// State for every instance of the job.
    #[serde(default)]
    pub state: Option<InstanceStateSpec>,
    /// Per-index state overrides.
    #[serde(default)]
    pub instance_states: BTreeMap<u32, InstanceStateSpec>,
}
