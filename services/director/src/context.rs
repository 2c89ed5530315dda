//! Collaborators shared by every updater in a run.

use std::collections::BTreeMap;
use std::sync::Arc;

use drydock_networking::Network;
use drydock_reconcile::{Cancellation, TaskPool};

use crate::agent::AgentFactory;
use crate::cloud::Cloud;
use crate::records::RecordStore;
use crate::DirectorConfig;

pub struct UpdateContext {
    pub deployment: String,
    pub config: DirectorConfig,
    pub cloud: Arc<dyn Cloud>,
    pub agents: Arc<dyn AgentFactory>,
    pub records: Arc<dyn RecordStore>,
    pub networks: BTreeMap<String, Arc<Network>>,
    pub cancellation: Cancellation,
}

impl UpdateContext {
    /// A task pool capped by both `max_in_flight` and the configured thread
    /// limit.
    pub fn task_pool(&self, max_in_flight: usize) -> TaskPool {
        TaskPool::new(
            max_in_flight.min(self.config.max_threads),
            self.cancellation.clone(),
        )
    }

    pub fn network(&self, name: &str) -> Option<&Arc<Network>> {
        self.networks.get(name)
    }
}
