//! Deployment plan: the validated model a run works against.
//!
//! Construction performs every validation up front, so a bad plan fails
//! before any cloud or agent call.

pub mod instance;
pub mod job;
pub mod resource_pool;
pub mod spec;
pub mod update_policy;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use drydock_id::StemcellCid;
use drydock_networking::{parse_address, Network, Reservation};
use drydock_reconcile::{ResourcePoolSpec, StemcellSpec};

use crate::plan::instance::{Instance, InstanceNetwork, UnneededInstance};
use crate::plan::job::{Job, JobNetwork};
use crate::plan::resource_pool::{ResourcePool, UnneededVm};
use crate::plan::spec::{InstanceStateSpec, JobSpec, PlanSpec};
use crate::plan::update_policy::UpdatePolicy;
use crate::{DirectorError, DirectorResult};

/// Defaults a job's networks must provide between them.
const NETWORK_DEFAULTS: [&str; 2] = ["dns", "gateway"];

#[derive(Debug)]
pub struct DeploymentPlan {
    pub name: String,
    pub recreate: bool,
    pub networks: BTreeMap<String, Arc<Network>>,
    /// In declaration order.
    pub resource_pools: Vec<Arc<ResourcePool>>,
    /// In declaration order, which is also the rollout order.
    pub jobs: Vec<Job>,
    pub unneeded_vms: Vec<UnneededVm>,
    /// Instances of jobs the plan no longer declares.
    pub unneeded_instances: Vec<UnneededInstance>,
}

fn invalid(msg: impl Into<String>) -> DirectorError {
    DirectorError::Validation(msg.into())
}

fn ensure_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> DirectorResult<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(invalid(format!("duplicate {} name '{}'", kind, name)));
        }
    }
    Ok(())
}

impl DeploymentPlan {
    pub fn from_spec(spec: &PlanSpec) -> DirectorResult<Self> {
        ensure_unique("network", spec.networks.iter().map(|n| n.name.as_str()))?;
        ensure_unique("resource pool", spec.resource_pools.iter().map(|p| p.name.as_str()))?;
        ensure_unique("job", spec.jobs.iter().map(|j| j.name.as_str()))?;

        let mut networks = BTreeMap::new();
        for network in &spec.networks {
            networks.insert(
                network.name.clone(),
                Arc::new(Network::new(network.name.clone(), &network.subnets)?),
            );
        }

        let mut resource_pools = Vec::new();
        for pool in &spec.resource_pools {
            let network = networks.get(&pool.network).cloned().ok_or_else(|| {
                invalid(format!(
                    "resource pool '{}' references unknown network '{}'",
                    pool.name, pool.network
                ))
            })?;
            let stemcell_cid = StemcellCid::parse(&pool.stemcell.cid).map_err(|e| {
                invalid(format!("resource pool '{}' stemcell: {}", pool.name, e))
            })?;
            resource_pools.push(Arc::new(ResourcePool::new(
                &spec.name,
                ResourcePoolSpec {
                    name: pool.name.clone(),
                    stemcell: StemcellSpec {
                        name: pool.stemcell.name.clone(),
                        version: pool.stemcell.version.clone(),
                    },
                    cloud_properties: pool.cloud_properties.clone(),
                },
                pool.size,
                stemcell_cid,
                network,
                pool.env.clone(),
            )));
        }

        let mut static_ips_seen = BTreeSet::new();
        let mut jobs = Vec::new();
        for job_spec in &spec.jobs {
            jobs.push(build_job(
                spec,
                job_spec,
                &networks,
                &resource_pools,
                &mut static_ips_seen,
            )?);
        }

        Ok(Self {
            name: spec.name.clone(),
            recreate: spec.recreate,
            networks,
            resource_pools,
            jobs,
            unneeded_vms: Vec::new(),
            unneeded_instances: Vec::new(),
        })
    }

    pub fn network(&self, name: &str) -> Option<&Arc<Network>> {
        self.networks.get(name)
    }

    pub fn resource_pool(&self, name: &str) -> Option<&Arc<ResourcePool>> {
        self.resource_pools.iter().find(|p| p.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }
}

fn build_job(
    plan: &PlanSpec,
    spec: &JobSpec,
    networks: &BTreeMap<String, Arc<Network>>,
    pools: &[Arc<ResourcePool>],
    static_ips_seen: &mut BTreeSet<(String, u32)>,
) -> DirectorResult<Job> {
    let resource_pool = pools
        .iter()
        .find(|p| p.name == spec.resource_pool)
        .cloned()
        .ok_or_else(|| {
            invalid(format!(
                "job '{}' references unknown resource pool '{}'",
                spec.name, spec.resource_pool
            ))
        })?;

    let update = UpdatePolicy::from_spec(
        &spec
            .update
            .as_ref()
            .map_or_else(|| plan.update.clone(), |u| u.merged_with(&plan.update)),
    )
    .map_err(|e| match e {
        DirectorError::Validation(msg) => invalid(format!("job '{}': {}", spec.name, msg)),
        other => other,
    })?;

    if spec.networks.is_empty() {
        return Err(invalid(format!("job '{}' must have at least one network", spec.name)));
    }
    ensure_unique(
        &format!("job '{}' network", spec.name),
        spec.networks.iter().map(|n| n.name.as_str()),
    )?;

    let mut job_networks = Vec::new();
    for net_spec in &spec.networks {
        let network = networks.get(&net_spec.name).cloned().ok_or_else(|| {
            invalid(format!(
                "job '{}' references unknown network '{}'",
                spec.name, net_spec.name
            ))
        })?;

        let static_ips = net_spec
            .static_ips
            .iter()
            .map(|raw| -> DirectorResult<_> {
                let ip = parse_address(raw)?;
                network.validate_static(ip)?;
                if !static_ips_seen.insert((net_spec.name.clone(), ip)) {
                    return Err(invalid(format!(
                        "static IP {} on network '{}' is used more than once",
                        raw, net_spec.name
                    )));
                }
                Ok(ip)
            })
            .collect::<DirectorResult<Vec<_>>>()?;
        if !static_ips.is_empty() && static_ips.len() != spec.instances as usize {
            return Err(invalid(format!(
                "job '{}' has {} static IPs on network '{}' but {} instances",
                spec.name,
                static_ips.len(),
                net_spec.name,
                spec.instances
            )));
        }

        let default = if spec.networks.len() == 1 {
            NETWORK_DEFAULTS.iter().map(|s| s.to_string()).collect()
        } else {
            net_spec.default.clone()
        };
        job_networks.push(JobNetwork {
            name: net_spec.name.clone(),
            network,
            static_ips,
            default,
        });
    }

    for property in NETWORK_DEFAULTS {
        let providers = job_networks
            .iter()
            .filter(|n| n.default.iter().any(|d| d == property))
            .count();
        if providers != 1 {
            return Err(invalid(format!(
                "job '{}' must have exactly one default network for {}, found {}",
                spec.name, property, providers
            )));
        }
    }

    if let Some((index, _)) = spec
        .instance_states
        .iter()
        .find(|(index, _)| **index >= spec.instances)
    {
        return Err(invalid(format!(
            "job '{}' sets a state for instance {} but has {} instances",
            spec.name, index, spec.instances
        )));
    }

    let mut job = Job {
        name: spec.name.clone(),
        template: spec.template.clone(),
        packages: spec
            .packages
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect(),
        resource_pool,
        persistent_disk: spec.persistent_disk,
        networks: job_networks,
        properties: spec.properties.clone(),
        update,
        instances: Vec::new(),
        unneeded_instances: Vec::new(),
    };

    for index in 0..spec.instances {
        let requested = spec
            .instance_states
            .get(&index)
            .copied()
            .or(spec.state)
            .unwrap_or(InstanceStateSpec::Started);
        let (desired_state, recreate, restart) = requested.expand();

        let networks = job
            .networks
            .iter()
            .map(|n| InstanceNetwork {
                name: n.name.clone(),
                reservation: match n.static_ips.get(index as usize) {
                    Some(ip) => Reservation::static_ip(*ip),
                    None => Reservation::dynamic(),
                },
                default: n.default.clone(),
            })
            .collect();

        // Placeholder spec until addresses are bound.
        let spec = drydock_reconcile::DesiredSpec::idle(
            plan.name.clone(),
            job.resource_pool.spec.clone(),
            Default::default(),
        );
        let mut instance = Instance::new(
            job.name.clone(),
            index,
            desired_state,
            networks,
            spec,
            job.resource_pool.env_hash(),
        );
        instance.set_flags(recreate || plan.recreate, restart);
        job.instances.push(instance);
    }

    tracing::debug!(job = %job.name, instances = job.instances.len(), "job planned");
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::spec::{
        JobNetworkSpec, NetworkSpec, ResourcePoolPlanSpec, StemcellPlanSpec, UpdatePolicySpec,
    };
    use drydock_networking::SubnetSpec;
    use drydock_reconcile::{JobTemplateSpec, RunState};

    fn plan_spec() -> PlanSpec {
        PlanSpec {
            name: "dep".into(),
            recreate: false,
            networks: vec![NetworkSpec {
                name: "default".into(),
                subnets: vec![SubnetSpec {
                    range: "10.0.0.0/24".into(),
                    gateway: Some("10.0.0.1".into()),
                    static_ips: vec!["10.0.0.10 - 10.0.0.20".into()],
                    ..SubnetSpec::default()
                }],
            }],
            resource_pools: vec![ResourcePoolPlanSpec {
                name: "small".into(),
                size: 3,
                stemcell: StemcellPlanSpec {
                    name: "ubuntu".into(),
                    version: "1".into(),
                    cid: "sc-1".into(),
                },
                network: "default".into(),
                cloud_properties: serde_json::json!({}),
                env: serde_json::json!({}),
            }],
            update: UpdatePolicySpec {
                canaries: Some(1),
                max_in_flight: Some(2),
                canary_watch_time: Some("1000".into()),
                update_watch_time: Some("1000".into()),
                max_errors: None,
            },
            jobs: vec![JobSpec {
                name: "web".into(),
                template: JobTemplateSpec {
                    name: "web".into(),
                    template: "nginx".into(),
                    version: "1".into(),
                    sha1: "abc".into(),
                    blobstore_id: "b1".into(),
                },
                packages: vec![],
                instances: 2,
                resource_pool: "small".into(),
                persistent_disk: 0,
                networks: vec![JobNetworkSpec {
                    name: "default".into(),
                    static_ips: vec![],
                    default: vec![],
                }],
                properties: serde_json::json!({}),
                update: None,
                state: None,
                instance_states: BTreeMap::new(),
            }],
        }
    }

    fn validation_message(spec: &PlanSpec) -> String {
        match DeploymentPlan::from_spec(spec).unwrap_err() {
            DirectorError::Validation(msg) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_plan() {
        let plan = DeploymentPlan::from_spec(&plan_spec()).unwrap();
        assert_eq!(plan.jobs.len(), 1);
        let job = &plan.jobs[0];
        assert_eq!(job.instances.len(), 2);
        assert_eq!(job.networks[0].default, vec!["dns", "gateway"]);
        assert_eq!(job.update.max_errors, 0);
        assert!(job.instances.iter().all(|i| i.changed()));
    }

    #[test]
    fn test_overlapping_subnets_fail_construction() {
        let mut spec = plan_spec();
        spec.networks[0].subnets.push(SubnetSpec {
            range: "10.0.0.128/25".into(),
            ..SubnetSpec::default()
        });
        assert!(matches!(
            DeploymentPlan::from_spec(&spec).unwrap_err(),
            DirectorError::Network(_)
        ));
    }

    #[test]
    fn test_unknown_references() {
        let mut spec = plan_spec();
        spec.jobs[0].resource_pool = "large".into();
        assert!(validation_message(&spec).contains("unknown resource pool 'large'"));

        let mut spec = plan_spec();
        spec.jobs[0].networks[0].name = "other".into();
        assert!(validation_message(&spec).contains("unknown network 'other'"));

        let mut spec = plan_spec();
        spec.resource_pools[0].network = "other".into();
        assert!(validation_message(&spec).contains("unknown network"));
    }

    #[test]
    fn test_static_ips() {
        let mut spec = plan_spec();
        spec.jobs[0].networks[0].static_ips = vec!["10.0.0.10".into(), "10.0.0.11".into()];
        let plan = DeploymentPlan::from_spec(&spec).unwrap();
        let reservation = &plan.jobs[0].instances[1].networks[0].reservation;
        assert!(reservation.is_static());
        assert_eq!(reservation.ip, Some(parse_address("10.0.0.11").unwrap()));

        let mut spec = plan_spec();
        spec.jobs[0].networks[0].static_ips = vec!["10.0.0.10".into()];
        assert!(validation_message(&spec).contains("1 static IPs"));

        let mut spec = plan_spec();
        spec.jobs[0].networks[0].static_ips = vec!["10.0.0.10".into(), "10.0.0.10".into()];
        assert!(validation_message(&spec).contains("more than once"));

        let mut spec = plan_spec();
        spec.jobs[0].networks[0].static_ips = vec!["10.0.0.50".into(), "10.0.0.51".into()];
        assert!(matches!(
            DeploymentPlan::from_spec(&spec).unwrap_err(),
            DirectorError::Network(drydock_networking::NetworkError::InvalidStaticIp { .. })
        ));
    }

    #[test]
    fn test_multiple_networks_need_one_default_each() {
        let mut spec = plan_spec();
        spec.networks.push(NetworkSpec {
            name: "backend".into(),
            subnets: vec![SubnetSpec {
                range: "10.1.0.0/24".into(),
                ..SubnetSpec::default()
            }],
        });
        spec.jobs[0].networks.push(JobNetworkSpec {
            name: "backend".into(),
            static_ips: vec![],
            default: vec![],
        });
        assert!(validation_message(&spec).contains("default network for dns"));

        spec.jobs[0].networks[0].default = vec!["dns".into(), "gateway".into()];
        assert!(DeploymentPlan::from_spec(&spec).is_ok());

        spec.jobs[0].networks[1].default = vec!["gateway".into()];
        assert!(validation_message(&spec).contains("found 2"));
    }

    #[test]
    fn test_instance_states_expand() {
        let mut spec = plan_spec();
        spec.jobs[0].state = Some(InstanceStateSpec::Stopped);
        spec.jobs[0].instance_states = BTreeMap::from([(1, InstanceStateSpec::Recreate)]);
        let plan = DeploymentPlan::from_spec(&spec).unwrap();
        let instances = &plan.jobs[0].instances;
        assert_eq!(instances[0].desired_state, RunState::Stopped);
        assert!(!instances[0].recreate);
        assert_eq!(instances[1].desired_state, RunState::Started);
        assert!(instances[1].recreate);

        spec.jobs[0].instance_states = BTreeMap::from([(5, InstanceStateSpec::Restart)]);
        assert!(validation_message(&spec).contains("instance 5"));
    }

    #[test]
    fn test_deployment_recreate_flags_every_instance() {
        let mut spec = plan_spec();
        spec.recreate = true;
        let plan = DeploymentPlan::from_spec(&spec).unwrap();
        assert!(plan.jobs[0].instances.iter().all(|i| i.recreate));
    }

    #[test]
    fn test_bad_watch_time_and_duplicates() {
        let mut spec = plan_spec();
        spec.update.canary_watch_time = Some("5000-1000".into());
        assert!(validation_message(&spec).contains("job 'web': invalid watch time"));

        let mut spec = plan_spec();
        spec.jobs.push(spec.jobs[0].clone());
        assert!(validation_message(&spec).contains("duplicate job name"));
    }
}
