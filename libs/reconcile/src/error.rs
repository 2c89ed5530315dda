use thiserror::Error;

/// The run was cancelled cooperatively.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled")]
pub struct Cancelled;

/// Failure of a batch submitted to a [`crate::TaskPool`].
#[derive(Debug, Error)]
pub enum TaskPoolError<E> {
    /// Cancellation was observed before a unit could launch.
    #[error("task cancelled")]
    Cancelled,

    /// A unit panicked or was aborted.
    #[error("unit panicked: {0}")]
    Panicked(String),

    /// The first unit to fail, unchanged.
    #[error(transparent)]
    Unit(E),
}

impl<E> From<Cancelled> for TaskPoolError<E> {
    fn from(_: Cancelled) -> Self {
        TaskPoolError::Cancelled
    }
}
