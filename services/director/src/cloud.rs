//! Infrastructure API contract.
//!
//! The cloud creates and deletes VMs and disks. Implementations talk to a
//! real provider; [`crate::sim::SimCloud`] keeps everything in memory.

use async_trait::async_trait;
use drydock_id::{AgentId, DiskCid, StemcellCid, VmCid};
use drydock_networking::NetworkSettings;
use thiserror::Error;

/// Cloud errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The VM or disk does not exist.
    #[error("{kind} '{cid}' not found")]
    NotFound { kind: &'static str, cid: String },

    /// The VM cannot change networks in place.
    #[error("VM '{0}' must be recreated to change networks")]
    VmMustBeRecreated(VmCid),

    /// Detach of a disk that is not attached to the VM.
    #[error("disk '{disk}' is not attached to VM '{vm}'")]
    NotAttached { vm: VmCid, disk: DiskCid },

    /// Provider quota or capacity exhausted.
    #[error("cloud capacity exhausted: {0}")]
    Capacity(String),

    /// Any other provider failure.
    #[error("cloud error: {0}")]
    Provider(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }
}

/// Everything the cloud needs to boot a VM.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateVmRequest {
    pub agent_id: AgentId,
    pub stemcell: StemcellCid,
    pub cloud_properties: serde_json::Value,
    pub networks: NetworkSettings,
    /// Disks the VM should be placed near.
    pub disks: Vec<DiskCid>,
    pub env: serde_json::Value,
}

/// Infrastructure API.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Boot a VM and return its cid.
    async fn create_vm(&self, request: CreateVmRequest) -> Result<VmCid, CloudError>;

    async fn delete_vm(&self, vm: &VmCid) -> Result<(), CloudError>;

    /// Create a persistent disk of `size_mib`, near `vm_hint` if given.
    async fn create_disk(&self, size_mib: u64, vm_hint: Option<&VmCid>)
        -> Result<DiskCid, CloudError>;

    async fn delete_disk(&self, disk: &DiskCid) -> Result<(), CloudError>;

    async fn attach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError>;

    async fn detach_disk(&self, vm: &VmCid, disk: &DiskCid) -> Result<(), CloudError>;

    /// Change the networks of a running VM. May answer
    /// [`CloudError::VmMustBeRecreated`].
    async fn configure_networks(
        &self,
        vm: &VmCid,
        networks: &NetworkSettings,
    ) -> Result<(), CloudError>;
}

/// Treat "not found" as success, for delete-style calls.
pub fn ignore_not_found(result: Result<(), CloudError>) -> Result<(), CloudError> {
    match result {
        Err(err) if err.is_not_found() => {
            tracing::debug!(error = %err, "ignoring missing cloud resource");
            Ok(())
        }
        other => other,
    }
}

/// Treat "not attached" and a missing VM as success, for `detach_disk`.
pub fn ignore_not_attached(result: Result<(), CloudError>) -> Result<(), CloudError> {
    match result {
        Err(err @ CloudError::NotAttached { .. }) => {
            tracing::debug!(error = %err, "disk already detached");
            Ok(())
        }
        other => ignore_not_found(other),
    }
}
