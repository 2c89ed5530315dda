//! Durable records of VMs, disks and instances.
//!
//! Facts learned during a run (VM cid, disk cid, agent id, addresses) are
//! written back as each step commits, so a later run can bind to them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use drydock_id::{AgentId, DiskCid, VmCid};
use drydock_reconcile::RunState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Record store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub cid: VmCid,
    pub agent_id: AgentId,
    pub deployment: String,
    /// Hash of the resource pool env the VM was created with.
    #[serde(default)]
    pub env_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub cid: DiskCid,
    pub size_mib: u64,
    /// False while a new disk is being migrated to.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub deployment: String,
    pub job: String,
    pub index: u32,
    pub state: RunState,
    #[serde(default)]
    pub vm: Option<VmCid>,
    #[serde(default)]
    pub disk: Option<DiskRecord>,
}

impl InstanceRecord {
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.index)
    }
}

/// Persistent storage for deployment records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn vms(&self, deployment: &str) -> Result<Vec<VmRecord>, RecordError>;

    async fn instances(&self, deployment: &str) -> Result<Vec<InstanceRecord>, RecordError>;

    async fn save_vm(&self, vm: &VmRecord) -> Result<(), RecordError>;

    async fn delete_vm(&self, cid: &VmCid) -> Result<(), RecordError>;

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<(), RecordError>;

    async fn delete_instance(&self, deployment: &str, job: &str, index: u32)
        -> Result<(), RecordError>;

    /// Upsert DNS A records (name to address).
    async fn publish_dns(&self, records: &BTreeMap<String, String>) -> Result<(), RecordError>;

    async fn delete_dns(&self, names: &[String]) -> Result<(), RecordError>;

    /// Published records among `names`.
    async fn lookup_dns(&self, names: &[String]) -> Result<BTreeMap<String, String>, RecordError>;
}

#[derive(Debug, Default)]
struct Tables {
    vms: BTreeMap<VmCid, VmRecord>,
    instances: BTreeMap<(String, String, u32), InstanceRecord>,
    dns: BTreeMap<String, String>,
}

/// Record store kept in memory, for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn vm(&self, cid: &VmCid) -> Option<VmRecord> {
        self.tables().vms.get(cid).cloned()
    }

    pub fn instance(&self, deployment: &str, job: &str, index: u32) -> Option<InstanceRecord> {
        self.tables()
            .instances
            .get(&(deployment.to_string(), job.to_string(), index))
            .cloned()
    }

    pub fn dns_records(&self) -> BTreeMap<String, String> {
        self.tables().dns.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn vms(&self, deployment: &str) -> Result<Vec<VmRecord>, RecordError> {
        Ok(self
            .tables()
            .vms
            .values()
            .filter(|vm| vm.deployment == deployment)
            .cloned()
            .collect())
    }

    async fn instances(&self, deployment: &str) -> Result<Vec<InstanceRecord>, RecordError> {
        Ok(self
            .tables()
            .instances
            .values()
            .filter(|i| i.deployment == deployment)
            .cloned()
            .collect())
    }

    async fn save_vm(&self, vm: &VmRecord) -> Result<(), RecordError> {
        self.tables().vms.insert(vm.cid.clone(), vm.clone());
        Ok(())
    }

    async fn delete_vm(&self, cid: &VmCid) -> Result<(), RecordError> {
        self.tables().vms.remove(cid);
        Ok(())
    }

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<(), RecordError> {
        let key = (
            instance.deployment.clone(),
            instance.job.clone(),
            instance.index,
        );
        self.tables().instances.insert(key, instance.clone());
        Ok(())
    }

    async fn delete_instance(
        &self,
        deployment: &str,
        job: &str,
        index: u32,
    ) -> Result<(), RecordError> {
        self.tables()
            .instances
            .remove(&(deployment.to_string(), job.to_string(), index));
        Ok(())
    }

    async fn publish_dns(&self, records: &BTreeMap<String, String>) -> Result<(), RecordError> {
        let mut tables = self.tables();
        for (name, ip) in records {
            tables.dns.insert(name.clone(), ip.clone());
        }
        Ok(())
    }

    async fn delete_dns(&self, names: &[String]) -> Result<(), RecordError> {
        let mut tables = self.tables();
        for name in names {
            tables.dns.remove(name);
        }
        Ok(())
    }

    async fn lookup_dns(&self, names: &[String]) -> Result<BTreeMap<String, String>, RecordError> {
        let tables = self.tables();
        Ok(names
            .iter()
            .filter_map(|name| tables.dns.get(name).map(|ip| (name.clone(), ip.clone())))
            .collect())
    }
}
