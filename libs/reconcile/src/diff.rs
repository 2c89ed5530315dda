//! Per-axis drift between a desired spec and an observed state.

use std::collections::BTreeMap;

use crate::{CurrentState, DesiredSpec, RunState};

/// One axis of drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Change {
    ResourcePool,
    Networks,
    PersistentDisk,
    Configuration,
    Packages,
    Job,
    State,
    Dns,
    Restart,
}

/// Operator or deployment requests that force an axis regardless of state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffFlags {
    /// Instance or deployment asked for VM recreation.
    pub recreate: bool,
    /// Instance asked for a restart.
    pub restart: bool,
}

/// Result of comparing desired and observed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateDiff {
    pub resource_pool: bool,
    pub networks: bool,
    pub persistent_disk: bool,
    pub configuration: bool,
    pub packages: bool,
    pub job: bool,
    pub state: bool,
    pub dns: bool,
    pub restart: bool,
}

impl StateDiff {
    pub fn compute(
        desired: &DesiredSpec,
        current: &CurrentState,
        run_state: RunState,
        flags: DiffFlags,
    ) -> Self {
        let no_packages = BTreeMap::new();
        Self {
            resource_pool: flags.recreate
                || current.resource_pool.as_ref() != Some(&desired.resource_pool),
            networks: current
                .networks
                .as_ref()
                .map_or(!desired.networks.is_empty(), |n| *n != desired.networks),
            persistent_disk: current.persistent_disk.unwrap_or(0) != desired.persistent_disk,
            configuration: current.configuration_hash != desired.configuration_hash,
            packages: *current.packages.as_ref().unwrap_or(&no_packages) != desired.packages,
            job: current.job != desired.job,
            state: state_changed(current, run_state),
            dns: dns_changed(desired, current),
            restart: flags.restart,
        }
    }

    /// Whether the instance needs any work.
    pub fn changed(&self) -> bool {
        !self.changes().is_empty()
    }

    /// Whether DNS is the only thing out of date.
    pub fn dns_only(&self) -> bool {
        self.changes() == [Change::Dns]
    }

    /// Changed axes, in a stable order.
    pub fn changes(&self) -> Vec<Change> {
        [
            (self.resource_pool, Change::ResourcePool),
            (self.networks, Change::Networks),
            (self.persistent_disk, Change::PersistentDisk),
            (self.configuration, Change::Configuration),
            (self.packages, Change::Packages),
            (self.job, Change::Job),
            (self.state, Change::State),
            (self.dns, Change::Dns),
            (self.restart, Change::Restart),
        ]
        .into_iter()
        .filter_map(|(flag, change)| flag.then_some(change))
        .collect()
    }
}

fn state_changed(current: &CurrentState, run_state: RunState) -> bool {
    match run_state {
        RunState::Started => !current.is_running(),
        RunState::Stopped => current.is_running(),
        // Anything still reporting in has to be detached.
        RunState::Detached => current.job_state.is_some(),
    }
}

fn dns_changed(desired: &DesiredSpec, current: &CurrentState) -> bool {
    if desired.dns_records.is_empty() {
        return false;
    }
    let Some(published) = current.dns_records.as_ref() else {
        return true;
    };
    desired
        .dns_records
        .iter()
        .any(|(name, ip)| published.get(name) != Some(ip))
}
