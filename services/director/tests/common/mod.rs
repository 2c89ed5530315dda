#![allow(dead_code)]

use std::sync::Arc;

use drydock_director::lock::InMemoryLeaseStore;
use drydock_director::plan::spec::PlanSpec;
use drydock_director::records::InMemoryRecordStore;
use drydock_director::sim::{SimAgentFactory, SimCloud};
use drydock_director::{DeploymentReport, DirectorConfig, DirectorResult, Reconciler};
use drydock_id::{AgentId, VmCid};
use drydock_reconcile::Cancellation;

pub const DEPLOYMENT: &str = "dep";

/// A deployment of one `web` job on one network.
pub fn plan(instances: u32, pool_size: usize) -> PlanSpec {
    serde_json::from_value(serde_json::json!({
        "name": DEPLOYMENT,
        "networks": [{
            "name": "default",
            "subnets": [{
                "range": "10.0.0.0/24",
                "gateway": "10.0.0.1",
                "dns": ["10.0.0.2"],
                "reserved": ["10.0.0.2 - 10.0.0.9"],
                "static": ["10.0.0.10 - 10.0.0.30"]
            }]
        }],
        "resource_pools": [{
            "name": "small",
            "size": pool_size,
            "stemcell": {"name": "ubuntu", "version": "1", "cid": "sc-1"},
            "network": "default",
            "cloud_properties": {"instance_type": "m1.small"}
        }],
        "update": {
            "canaries": 1,
            "max_in_flight": 1,
            "canary_watch_time": "1000",
            "update_watch_time": "1000"
        },
        "jobs": [{
            "name": "web",
            "template": {
                "name": "web",
                "template": "nginx",
                "version": "1",
                "sha1": "abc",
                "blobstore_id": "blob-1"
            },
            "instances": instances,
            "resource_pool": "small",
            "networks": [{"name": "default"}],
            "properties": {"port": 80}
        }]
    }))
    .unwrap()
}

pub fn job_template(name: &str) -> drydock_reconcile::JobTemplateSpec {
    drydock_reconcile::JobTemplateSpec {
        name: name.into(),
        template: name.into(),
        version: "1".into(),
        sha1: "abc".into(),
        blobstore_id: format!("blob-{name}"),
    }
}

pub struct Harness {
    pub cloud: Arc<SimCloud>,
    pub agents: Arc<SimAgentFactory>,
    pub records: Arc<InMemoryRecordStore>,
    pub leases: Arc<InMemoryLeaseStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            cloud: Arc::new(SimCloud::new()),
            agents: Arc::new(SimAgentFactory::new()),
            records: Arc::new(InMemoryRecordStore::new()),
            leases: Arc::new(InMemoryLeaseStore::new()),
        }
    }

    pub fn reconciler(&self, config: DirectorConfig, cancellation: Cancellation) -> Reconciler {
        Reconciler::new(
            config,
            self.cloud.clone(),
            self.agents.clone(),
            self.records.clone(),
            self.leases.clone(),
            cancellation,
        )
    }

    pub async fn run_with(&self, plan: &PlanSpec, config: DirectorConfig) -> DirectorResult<DeploymentReport> {
        self.reconciler(config, Cancellation::never()).run(plan).await
    }

    pub async fn run(&self, plan: &PlanSpec) -> DirectorResult<DeploymentReport> {
        self.run_with(plan, DirectorConfig::default()).await
    }

    /// Forget the journals of earlier runs.
    pub fn clear_calls(&self) {
        self.cloud.clear_calls();
        self.agents.clear_calls();
    }

    pub fn vm_of(&self, job: &str, index: u32) -> Option<VmCid> {
        self.records.instance(DEPLOYMENT, job, index)?.vm
    }

    pub fn agent_of(&self, job: &str, index: u32) -> Option<AgentId> {
        Some(self.records.vm(&self.vm_of(job, index)?)?.agent_id)
    }

    /// Operations journaled for one agent, without state queries.
    pub fn agent_ops(&self, agent_id: AgentId) -> Vec<String> {
        self.agents
            .calls()
            .into_iter()
            .filter(|c| c.agent_id == agent_id && c.operation != "get_state")
            .map(|c| c.operation)
            .collect()
    }
}
