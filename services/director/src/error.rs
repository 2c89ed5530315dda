//! Error types for the director.

use drydock_networking::NetworkError;
use drydock_reconcile::{Cancelled, TaskPoolError};
use thiserror::Error;

use crate::agent::AgentError;
use crate::cloud::CloudError;
use crate::lock::LockError;
use crate::records::RecordError;

/// Director errors.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// Invalid director configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The plan is inconsistent; raised before any cloud or agent call.
    #[error("invalid plan: {0}")]
    Validation(String),

    /// Address management failure.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A resource pool has no room left.
    #[error("resource pool '{pool}' is out of capacity (size {size})")]
    Capacity { pool: String, size: usize },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// An operation needed the instance's VM but none is bound.
    #[error("instance has no VM")]
    MissingVm,

    /// The agent did not accept the applied spec.
    #[error("apply returned state '{state}'")]
    ApplyFailed { state: String },

    /// A started instance was not running when its watch window closed.
    #[error("job is not running after update")]
    AgentJobNotRunning,

    /// A stopped instance was still running when its watch window closed.
    #[error("job is still running after stop")]
    AgentJobNotStopped,

    /// Failure of one instance, tagged with its identity.
    #[error("{instance}: {source}")]
    Instance {
        instance: String,
        #[source]
        source: Box<DirectorError>,
    },

    /// A job rollout halted; carries the error that caused the halt.
    #[error("job '{job}' rolled back: {source}")]
    Rollback {
        job: String,
        #[source]
        source: Box<DirectorError>,
    },

    #[error("task cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

impl DirectorError {
    /// Tag an error with the instance it happened on.
    pub fn for_instance(self, instance: impl Into<String>) -> Self {
        match self {
            err @ (DirectorError::Instance { .. } | DirectorError::Cancelled) => err,
            other => DirectorError::Instance {
                instance: instance.into(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, DirectorError::Rollback { .. })
    }

    pub fn is_capacity_error(&self) -> bool {
        match self {
            DirectorError::Capacity { .. } => true,
            DirectorError::Network(err) => err.is_capacity_error(),
            DirectorError::Instance { source, .. } => source.is_capacity_error(),
            _ => false,
        }
    }

    /// The innermost error, past instance and rollback wrappers.
    pub fn root(&self) -> &DirectorError {
        match self {
            DirectorError::Instance { source, .. } | DirectorError::Rollback { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}

impl From<Cancelled> for DirectorError {
    fn from(_: Cancelled) -> Self {
        DirectorError::Cancelled
    }
}

impl From<TaskPoolError<DirectorError>> for DirectorError {
    fn from(err: TaskPoolError<DirectorError>) -> Self {
        match err {
            TaskPoolError::Cancelled => DirectorError::Cancelled,
            TaskPoolError::Panicked(msg) => DirectorError::TaskPanicked(msg),
            TaskPoolError::Unit(err) => err,
        }
    }
}

/// Result type for director operations.
pub type DirectorResult<T> = Result<T, DirectorError>;
