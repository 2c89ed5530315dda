//! Reconciliation primitives.
//!
//! This library provides the pieces a rollout is built from:
//!
//! - **Desired state**: the spec an instance should converge to.
//! - **Current state**: what the agent on the VM reports.
//! - **Drift**: a per-axis comparison of the two.
//! - **Execution**: a cancellable, fail-fast, bounded task pool.
//!
//! # Invariants
//!
//! - Drift detection is pure and deterministic given the same inputs
//! - Missing observed fields compare as their unset value
//! - The task pool never runs more than its capacity at once

mod cancel;
mod diff;
mod error;
mod hash;
mod state;
mod task_pool;

pub use cancel::{CancelHandle, Cancellation};
pub use diff::{Change, DiffFlags, StateDiff};
pub use error::{Cancelled, TaskPoolError};
pub use hash::SpecHash;
pub use state::{
    CurrentState, DesiredSpec, JobState, JobTemplateSpec, PackageSpec, ResourcePoolSpec, RunState,
    StemcellSpec,
};
pub use task_pool::TaskPool;

/// Default number of units a task pool runs at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;
