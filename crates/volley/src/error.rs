use thiserror::Error;

/// Failures raised by the concurrency core itself.
///
/// Transport failures are not represented here: they travel inside
/// [`Response::error`](crate::Response) as an [`ErrorInfo`](crate::ErrorInfo).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("request was cancelled")]
    Cancelled,

    #[error("future is invalid (already consumed or never attached to a task)")]
    InvalidFuture,

    #[error("task was discarded before it ran")]
    Abandoned,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("multiplexer failure: {0}")]
    Multiplex(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for misuse of a cancellable handle, as opposed to a failure of the work itself.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, Self::Cancelled | Self::InvalidFuture)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
