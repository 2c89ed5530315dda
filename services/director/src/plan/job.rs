//! Jobs: a template deployed as a numbered set of instances.

use std::collections::BTreeMap;
use std::sync::Arc;

use drydock_networking::{Address, Network};
use drydock_reconcile::{DesiredSpec, JobTemplateSpec, PackageSpec, SpecHash};

use crate::plan::instance::{dns_record_name, Instance, UnneededInstance};
use crate::plan::resource_pool::ResourcePool;
use crate::plan::update_policy::UpdatePolicy;
use crate::{DirectorError, DirectorResult};

/// A network a job is attached to.
#[derive(Debug, Clone)]
pub struct JobNetwork {
    pub name: String,
    pub network: Arc<Network>,
    /// One per instance, or empty for dynamic addressing.
    pub static_ips: Vec<Address>,
    pub default: Vec<String>,
}

#[derive(Debug)]
pub struct Job {
    pub name: String,
    pub template: JobTemplateSpec,
    pub packages: BTreeMap<String, PackageSpec>,
    pub resource_pool: Arc<ResourcePool>,
    pub persistent_disk: u64,
    pub networks: Vec<JobNetwork>,
    pub properties: serde_json::Value,
    pub update: UpdatePolicy,
    /// Ordered by index.
    pub instances: Vec<Instance>,
    pub unneeded_instances: Vec<UnneededInstance>,
}

impl Job {
    pub fn configuration_hash(&self) -> String {
        SpecHash::from_json(&serde_json::json!({
            "template": self.template,
            "properties": self.properties,
        }))
        .to_string()
    }

    pub fn network(&self, name: &str) -> Option<&JobNetwork> {
        self.networks.iter().find(|n| n.name == name)
    }

    /// The full spec for `instance`. Every network reservation must be
    /// fulfilled.
    pub fn desired_spec(&self, instance: &Instance, dns_enabled: bool) -> DirectorResult<DesiredSpec> {
        let deployment = self.resource_pool.deployment.clone();
        let mut networks = BTreeMap::new();
        let mut dns_records = BTreeMap::new();

        for binding in &instance.networks {
            let job_network = self.network(&binding.name).ok_or_else(|| {
                DirectorError::Validation(format!(
                    "{}: unknown network '{}'",
                    instance.name(),
                    binding.name
                ))
            })?;
            let ip = binding
                .reservation
                .ip
                .filter(|_| binding.reservation.is_fulfilled())
                .ok_or_else(|| {
                    DirectorError::Validation(format!(
                        "{}: no address reserved on network '{}'",
                        instance.name(),
                        binding.name
                    ))
                })?;
            let setting = job_network.network.network_settings(ip, &binding.default)?;
            if dns_enabled {
                dns_records.insert(
                    dns_record_name(instance.index, &self.name, &binding.name, &deployment),
                    setting.ip.clone(),
                );
            }
            networks.insert(binding.name.clone(), setting);
        }

        Ok(DesiredSpec {
            deployment,
            index: instance.index,
            networks,
            resource_pool: self.resource_pool.spec.clone(),
            job: Some(self.template.clone()),
            packages: self.packages.clone(),
            persistent_disk: self.persistent_disk,
            configuration_hash: Some(self.configuration_hash()),
            properties: self.properties.clone(),
            dns_records,
        })
    }

    /// Index order, which is also the canary order.
    pub fn sort_instances(&mut self) {
        self.instances.sort_by_key(|i| i.index);
    }
}
