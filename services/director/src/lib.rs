//! drydock director
//!
//! Reconciles a deployment plan against a fleet of VMs: allocates addresses
//! and pooled VMs, detects drift per instance, and rolls changes out job by
//! job with canaries, bounded concurrency and automatic halting.
//!
//! ## Architecture
//!
//! - **Plan**: validated deployment model built from a [`plan::PlanSpec`]
//! - **Binder**: attaches existing VMs, disks and addresses to the plan
//! - **Resource pool updater**: keeps each pool stocked with idle VMs
//! - **Job updater**: canaries, then bulk updates through a task pool
//! - **Instance updater**: per-instance drain/recreate/apply/watch
//! - **Collaborators**: [`cloud::Cloud`], [`agent::Agent`],
//!   [`records::RecordStore`] and [`lock::LeaseStore`] traits with
//!   in-memory implementations in [`sim`]

pub mod agent;
pub mod binder;
pub mod cloud;
pub mod config;
pub mod context;
pub mod error;
pub mod instance_deleter;
pub mod instance_updater;
pub mod job_updater;
pub mod lock;
pub mod plan;
pub mod reconciler;
pub mod records;
pub mod resource_pool_updater;
pub mod sim;
pub mod vm_reuse;

pub use config::DirectorConfig;
pub use error::{DirectorError, DirectorResult};
pub use reconciler::{DeploymentReport, Reconciler};
