//! Desired and observed instance state.

use std::collections::BTreeMap;

use drydock_networking::NetworkSettings;
use serde::{Deserialize, Serialize};

/// The run state an instance is asked to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Started,
    Stopped,
    Detached,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::Stopped => "stopped",
            RunState::Detached => "detached",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job process state as reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Starting,
    Stopped,
    Failing,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellSpec {
    pub name: String,
    pub version: String,
}

/// What a VM is built from. Any difference forces recreation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolSpec {
    pub name: String,
    pub stemcell: StemcellSpec,
    #[serde(default)]
    pub cloud_properties: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplateSpec {
    pub name: String,
    pub template: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    pub sha1: String,
    pub blobstore_id: String,
}

/// The full spec applied to an instance's agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub deployment: String,
    pub index: u32,
    pub networks: NetworkSettings,
    pub resource_pool: ResourcePoolSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobTemplateSpec>,
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSpec>,
    /// Persistent disk size in MiB; 0 means no disk.
    #[serde(default)]
    pub persistent_disk: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Value,
    /// DNS record name to address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dns_records: BTreeMap<String, String>,
}

impl DesiredSpec {
    /// Spec for a VM that belongs to a pool but runs no job.
    pub fn idle(
        deployment: impl Into<String>,
        resource_pool: ResourcePoolSpec,
        networks: NetworkSettings,
    ) -> Self {
        Self {
            deployment: deployment.into(),
            index: 0,
            networks,
            resource_pool,
            job: None,
            packages: BTreeMap::new(),
            persistent_disk: 0,
            configuration_hash: None,
            properties: serde_json::Value::Null,
            dns_records: BTreeMap::new(),
        }
    }

    /// Spec applied right after a VM is (re)created for this instance: the
    /// instance identity without packages or configuration.
    pub fn bootstrap(&self, attached_disk: u64) -> Self {
        Self {
            deployment: self.deployment.clone(),
            index: self.index,
            networks: self.networks.clone(),
            resource_pool: self.resource_pool.clone(),
            job: self.job.clone(),
            packages: BTreeMap::new(),
            persistent_disk: attached_disk,
            configuration_hash: None,
            properties: serde_json::Value::Null,
            dns_records: BTreeMap::new(),
        }
    }
}

/// State reported by an agent. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrentState {
    pub deployment: Option<String>,
    pub index: Option<u32>,
    pub networks: Option<NetworkSettings>,
    pub resource_pool: Option<ResourcePoolSpec>,
    pub job: Option<JobTemplateSpec>,
    pub packages: Option<BTreeMap<String, PackageSpec>>,
    pub persistent_disk: Option<u64>,
    pub configuration_hash: Option<String>,
    pub job_state: Option<JobState>,
    pub dns_records: Option<BTreeMap<String, String>>,
}

impl CurrentState {
    /// The state an agent reports after `spec` has been applied.
    pub fn from_applied(spec: &DesiredSpec, job_state: Option<JobState>) -> Self {
        Self {
            deployment: Some(spec.deployment.clone()),
            index: Some(spec.index),
            networks: Some(spec.networks.clone()),
            resource_pool: Some(spec.resource_pool.clone()),
            job: spec.job.clone(),
            packages: Some(spec.packages.clone()),
            persistent_disk: Some(spec.persistent_disk),
            configuration_hash: spec.configuration_hash.clone(),
            job_state,
            dns_records: Some(spec.dns_records.clone()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.job_state == Some(JobState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_state_tolerates_missing_fields() {
        let state: CurrentState = serde_json::from_str(r#"{"job_state": "running"}"#).unwrap();
        assert!(state.is_running());
        assert!(state.networks.is_none());
        assert_eq!(state.persistent_disk, None);
    }

    #[test]
    fn test_unknown_job_state() {
        let state: CurrentState =
            serde_json::from_str(r#"{"job_state": "something-new"}"#).unwrap();
        assert_eq!(state.job_state, Some(JobState::Unknown));
    }

    #[test]
    fn test_run_state_serde() {
        let state: RunState = serde_json::from_str("\"detached\"").unwrap();
        assert_eq!(state, RunState::Detached);
        assert_eq!(RunState::default().to_string(), "started");
    }
}
