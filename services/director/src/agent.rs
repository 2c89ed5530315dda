//! Agent contract.
//!
//! Every VM runs an agent that applies specs, reports state and manages the
//! job processes and disks on the VM.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drydock_id::{AgentId, DiskCid};
use drydock_networking::NetworkSettings;
use drydock_reconcile::{Cancellation, CurrentState, DesiredSpec};
use thiserror::Error;
use tracing::debug;

use crate::DirectorResult;

/// Agent errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent did not answer in time.
    #[error("agent '{agent_id}' timed out during {operation}")]
    Timeout {
        agent_id: AgentId,
        operation: &'static str,
    },

    /// An agent task finished with an error.
    #[error("agent '{agent_id}' failed {operation}: {message}")]
    TaskFailed {
        agent_id: AgentId,
        operation: &'static str,
        message: String,
    },
}

/// Reply to `apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// `done` on success.
    pub state: String,
    pub agent_task_id: Option<String>,
}

impl ApplyResult {
    pub fn is_done(&self) -> bool {
        self.state == "done"
    }
}

/// What the agent should drain for.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainMode {
    /// The VM is going away or losing its disk or networks.
    Shutdown,
    /// The job is being updated in place to the given spec.
    Update(Box<DesiredSpec>),
    /// Ask how much longer an earlier drain needs.
    Status,
}

impl DrainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainMode::Shutdown => "shutdown",
            DrainMode::Update(_) => "update",
            DrainMode::Status => "status",
        }
    }
}

/// How to wait out a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainDirective {
    /// Sleep this long, then the drain is over.
    Wait(Duration),
    /// Sleep this long, then ask for `status` again.
    Poll(Duration),
    /// Nothing to wait for.
    Done,
}

impl DrainDirective {
    /// Interpret a `shutdown`/`update` reply in seconds: positive waits,
    /// negative asks to poll.
    pub fn from_reply(secs: i64) -> Self {
        match secs {
            0 => DrainDirective::Done,
            s if s > 0 => DrainDirective::Wait(Duration::from_secs(s.unsigned_abs())),
            s => DrainDirective::Poll(Duration::from_secs(s.unsigned_abs())),
        }
    }

    /// Interpret a `status` reply in seconds: positive keeps polling.
    pub fn from_status_reply(secs: i64) -> Self {
        if secs > 0 {
            DrainDirective::Poll(Duration::from_secs(secs.unsigned_abs()))
        } else {
            DrainDirective::Done
        }
    }
}

/// Agent RPC interface.
#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_id(&self) -> AgentId;

    /// Apply a spec. Anything but a `done` state is a failure.
    async fn apply(&self, spec: &DesiredSpec) -> Result<ApplyResult, AgentError>;

    async fn get_state(&self) -> Result<CurrentState, AgentError>;

    async fn drain(&self, mode: &DrainMode) -> Result<DrainDirective, AgentError>;

    async fn stop(&self) -> Result<(), AgentError>;

    async fn start(&self) -> Result<(), AgentError>;

    /// Block until the agent on a fresh or reconfigured VM answers.
    async fn wait_until_ready(&self) -> Result<(), AgentError>;

    async fn mount_disk(&self, disk: &DiskCid) -> Result<(), AgentError>;

    async fn unmount_disk(&self, disk: &DiskCid) -> Result<(), AgentError>;

    /// Copy persistent data from `old` to `new`; both are mounted.
    async fn migrate_disk(&self, old: &DiskCid, new: &DiskCid) -> Result<(), AgentError>;

    async fn prepare_network_change(&self, networks: &NetworkSettings) -> Result<(), AgentError>;
}

/// Resolves agent ids to clients.
pub trait AgentFactory: Send + Sync {
    fn agent(&self, agent_id: &AgentId) -> Arc<dyn Agent>;
}

/// Drain the job on `agent` and stop it.
///
/// A polled drain sleeps between `status` calls and checks `cancellation`
/// before each one.
pub async fn drain_and_stop(
    agent: &dyn Agent,
    mode: &DrainMode,
    cancellation: &Cancellation,
) -> DirectorResult<()> {
    let mut directive = agent.drain(mode).await?;
    debug!(agent_id = %agent.agent_id(), mode = mode.as_str(), ?directive, "drain requested");

    loop {
        match directive {
            DrainDirective::Done => break,
            DrainDirective::Wait(delay) => {
                tokio::time::sleep(delay).await;
                break;
            }
            DrainDirective::Poll(delay) => {
                cancellation.check()?;
                tokio::time::sleep(delay).await;
                let reply = agent.drain(&DrainMode::Status).await?;
                debug!(agent_id = %agent.agent_id(), ?reply, "drain status");
                directive = reply;
            }
        }
    }

    agent.stop().await?;
    Ok(())
}
